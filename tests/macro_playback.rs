//! End-to-end report assembly: protocol and macro engine wired together
//! the way a controller server drives them each cycle.

use std::time::{Duration, Instant};

use nxpad::bluetooth::l2cap::BdAddr;
use nxpad::constants::REPORT_SIZE;
use nxpad::controller::input::InputParser;
use nxpad::controller::protocol::ControllerProtocol;
use nxpad::controller::{ControllerIdentity, ControllerKind};

const ADAPTER_ADDRESS: BdAddr = BdAddr([0x7C, 0xBB, 0x8A, 0xAA, 0xBB, 0xCC]);

fn switch_message(subcommand: u8, args: &[u8]) -> Vec<u8> {
    let mut report = vec![0u8; REPORT_SIZE];
    report[0] = 0xA2;
    report[11] = subcommand;
    report[12..12 + args.len()].copy_from_slice(args);
    report
}

/// Replays the handshake a Switch performs after accepting a controller.
fn connected_protocol(kind: ControllerKind) -> ControllerProtocol {
    let mut protocol =
        ControllerProtocol::new(ControllerIdentity::new(kind, ADAPTER_ADDRESS, None, None));

    let handshake: Vec<Vec<u8>> = vec![
        switch_message(0x02, &[]),                          // device info
        switch_message(0x08, &[0x00]),                      // shipment
        switch_message(0x10, &[0x00, 0x60, 0x00, 0x00, 16]), // serial
        switch_message(0x10, &[0x50, 0x60, 0x00, 0x00, 13]), // colours
        switch_message(0x03, &[0x30]),                      // standard mode
        switch_message(0x40, &[0x01]),                      // IMU on
        switch_message(0x48, &[0x01]),                      // vibration
        switch_message(0x30, &[0x01]),                      // player 1 lights
    ];
    for message in handshake {
        assert!(!protocol.is_paired());
        protocol.process(Some(&message));
        let report = protocol.take_report();
        assert_eq!(report[0], 0xA1);
        assert_eq!(report[1], 0x21);
    }
    assert!(protocol.is_paired());
    assert!(protocol.device_info_queried());
    protocol
}

/// One server cycle without the socket: process inbound, merge parser
/// output, take the assembled report.
fn cycle(protocol: &mut ControllerProtocol, parser: &mut InputParser, now: Instant) -> [u8; 50] {
    protocol.process(None);
    let frame = parser.poll(None, now);
    protocol.apply_frame(frame.as_ref());
    protocol.take_report()
}

#[test]
fn pairing_handshake_completes() {
    connected_protocol(ControllerKind::ProController);
    connected_protocol(ControllerKind::JoyConL);
    connected_protocol(ControllerKind::JoyConR);
}

#[test]
fn macro_playback_drives_the_button_bytes() {
    let mut protocol = connected_protocol(ControllerKind::ProController);
    let mut parser = InputParser::new();
    parser.buffer_macro("A 0.5s\n0.5s", "macro-1");
    let start = Instant::now();

    // During the hold: A pressed, sticks resting at their centres
    for offset in [0, 100, 450] {
        let report = cycle(
            &mut protocol,
            &mut parser,
            start + Duration::from_millis(offset),
        );
        assert_eq!(report[1], 0x30);
        assert_eq!(report[4], 0x08, "A held at t+{offset}ms");
        assert_eq!(&report[5..7], &[0, 0]);
        assert_eq!(&report[7..10], &[0x6F, 0xC8, 0x77]);
        assert_eq!(&report[10..13], &[0x16, 0xD8, 0x7D]);
    }

    // The hold line expires with one final application
    cycle(&mut protocol, &mut parser, start + Duration::from_millis(510));

    // During the wait: no buttons
    for offset in [520, 700, 990] {
        let report = cycle(
            &mut protocol,
            &mut parser,
            start + Duration::from_millis(offset),
        );
        assert_eq!(&report[4..7], &[0, 0, 0], "no buttons at t+{offset}ms");
    }

    // Past the end: the macro id is reported finished
    cycle(&mut protocol, &mut parser, start + Duration::from_millis(1010));
    assert_eq!(parser.take_finished(), vec!["macro-1".to_string()]);
}

#[test]
fn stick_tilt_macro_packs_the_calibrated_position() {
    let mut protocol = connected_protocol(ControllerKind::ProController);
    let mut parser = InputParser::new();
    parser.buffer_macro("L_STICK@+100+000 0.1s\n0.1s", "tilt");
    let start = Instant::now();

    let report = cycle(&mut protocol, &mut parser, start);
    // ux = center_x + max_x = 3676, uy = center_y = 1916
    assert_eq!(&report[7..10], &[0x5C, 0xCE, 0x77]);
    // The right stick is untouched by the left tilt
    assert_eq!(&report[10..13], &[0x16, 0xD8, 0x7D]);
}

#[test]
fn nested_loop_macro_runs_to_its_expanded_length() {
    let mut protocol = connected_protocol(ControllerKind::ProController);
    let mut parser = InputParser::new();
    parser.buffer_macro("LOOP 2\n\tLOOP 3\n\t\tB 0.1s\n\t\t0.1s\n", "loops");
    let start = Instant::now();

    // 12 expanded lines of 0.1s each: presses on even deciseconds
    let mut presses = 0;
    for tick in 0..160 {
        let now = start + Duration::from_millis(tick * 10);
        let report = cycle(&mut protocol, &mut parser, now);
        if report[4] == 0x04 {
            presses += 1;
        }
    }
    assert!(presses > 0);
    assert_eq!(parser.take_finished(), vec!["loops".to_string()]);
}

#[test]
fn joycon_macro_input_respects_stick_gating() {
    let mut protocol = connected_protocol(ControllerKind::JoyConR);
    let mut parser = InputParser::new();
    parser.buffer_macro("L_STICK@+100+000 R_STICK@+100+000 A 0.1s", "gated");
    let start = Instant::now();

    let report = cycle(&mut protocol, &mut parser, start);
    assert_eq!(report[4], 0x08);
    // Left stick bytes stay zero on a right Joy-Con
    assert_eq!(&report[7..10], &[0, 0, 0]);
    assert_ne!(&report[10..13], &[0, 0, 0]);
}

#[test]
fn timer_is_monotone_mod_256_against_wall_time() {
    let mut protocol = connected_protocol(ControllerKind::ProController);

    protocol.process(None);
    let first = protocol.take_report()[2];

    std::thread::sleep(Duration::from_millis(50));
    let before = Instant::now();
    protocol.process(None);
    let second = protocol.take_report()[2];

    // 50ms of wall time is 200 timer ticks; allow slack for scheduling
    let delta = second.wrapping_sub(first) as u64;
    assert!(
        (195..=240).contains(&delta),
        "timer stepped by {delta} ticks after ~50ms (elapsed {:?})",
        before.elapsed()
    );
}

#[test]
fn subcommand_replies_embed_live_input() {
    let mut protocol = connected_protocol(ControllerKind::ProController);
    let mut parser = InputParser::new();
    parser.buffer_macro("ZL ZR 1.0s", "triggers");

    // A subcommand arrives mid-macro; its 0x21 reply still carries input
    protocol.process(Some(&switch_message(0x08, &[0x00])));
    let frame = parser.poll(None, Instant::now());
    protocol.apply_frame(frame.as_ref());
    let report = protocol.take_report();
    assert_eq!(report[1], 0x21);
    assert_eq!(report[4], 0x80);
    assert_eq!(report[6], 0x80);
    assert_eq!(report[14], 0x80);
    assert_eq!(report[15], 0x08);
}
