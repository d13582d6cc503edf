use std::time::{Duration, Instant};

use crate::controller::input::{
    parse_macro, repair_frames, stick_position, stick_ratios, InputPacket, InputParser,
    MacroError, Stick,
};
use crate::controller::ControllerKind;

fn frame_buttons(text: &str) -> [u8; 3] {
    let frames = parse_macro(text).unwrap();
    assert_eq!(frames.len(), 1);
    frames[0].buttons.to_bytes()
}

#[test]
fn button_tokens_map_to_their_wire_bits() {
    // Upper byte: Y, X, B, A, JCL_SR, JCL_SL, R, ZR on bits 0..7
    assert_eq!(frame_buttons("Y 0.1s"), [0x01, 0x00, 0x00]);
    assert_eq!(frame_buttons("X 0.1s"), [0x02, 0x00, 0x00]);
    assert_eq!(frame_buttons("B 0.1s"), [0x04, 0x00, 0x00]);
    assert_eq!(frame_buttons("A 0.1s"), [0x08, 0x00, 0x00]);
    assert_eq!(frame_buttons("JCL_SR 0.1s"), [0x10, 0x00, 0x00]);
    assert_eq!(frame_buttons("JCL_SL 0.1s"), [0x20, 0x00, 0x00]);
    assert_eq!(frame_buttons("R 0.1s"), [0x40, 0x00, 0x00]);
    assert_eq!(frame_buttons("ZR 0.1s"), [0x80, 0x00, 0x00]);

    // Shared byte: MINUS, PLUS, R_STICK_PRESS, L_STICK_PRESS, HOME, CAPTURE
    assert_eq!(frame_buttons("MINUS 0.1s"), [0x00, 0x01, 0x00]);
    assert_eq!(frame_buttons("PLUS 0.1s"), [0x00, 0x02, 0x00]);
    assert_eq!(frame_buttons("R_STICK_PRESS 0.1s"), [0x00, 0x04, 0x00]);
    assert_eq!(frame_buttons("L_STICK_PRESS 0.1s"), [0x00, 0x08, 0x00]);
    assert_eq!(frame_buttons("HOME 0.1s"), [0x00, 0x10, 0x00]);
    assert_eq!(frame_buttons("CAPTURE 0.1s"), [0x00, 0x20, 0x00]);

    // Lower byte: DPAD_DOWN, DPAD_UP, DPAD_RIGHT, DPAD_LEFT, JCR_SR,
    // JCR_SL, L, ZL
    assert_eq!(frame_buttons("DPAD_DOWN 0.1s"), [0x00, 0x00, 0x01]);
    assert_eq!(frame_buttons("DPAD_UP 0.1s"), [0x00, 0x00, 0x02]);
    assert_eq!(frame_buttons("DPAD_RIGHT 0.1s"), [0x00, 0x00, 0x04]);
    assert_eq!(frame_buttons("DPAD_LEFT 0.1s"), [0x00, 0x00, 0x08]);
    assert_eq!(frame_buttons("JCR_SR 0.1s"), [0x00, 0x00, 0x10]);
    assert_eq!(frame_buttons("JCR_SL 0.1s"), [0x00, 0x00, 0x20]);
    assert_eq!(frame_buttons("L 0.1s"), [0x00, 0x00, 0x40]);
    assert_eq!(frame_buttons("ZL 0.1s"), [0x00, 0x00, 0x80]);

    // Combinations OR together
    assert_eq!(frame_buttons("A B L ZR 0.1s"), [0x8C, 0x00, 0x40]);
}

#[test]
fn wait_lines_hold_nothing() {
    let frames = parse_macro("0.5s").unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].buttons.to_bytes(), [0, 0, 0]);
    assert_eq!(frames[0].left_stick, None);
    assert_eq!(frames[0].right_stick, None);
    assert_eq!(frames[0].duration, Duration::from_millis(500));
}

#[test]
fn comments_and_blank_lines_are_dropped() {
    let frames = parse_macro("# warmup\n\n   \nA 0.1s\n# done\n").unwrap();
    assert_eq!(frames.len(), 1);
}

#[test]
fn empty_macros_parse_to_nothing() {
    assert!(parse_macro("").unwrap().is_empty());
    assert!(parse_macro("   \n\t\n").unwrap().is_empty());
}

#[test]
fn loops_replicate_their_body() {
    let frames = parse_macro("LOOP 2\n\tA 0.1s\n\t0.2s").unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0].buttons.to_bytes(), [0x08, 0, 0]);
    assert_eq!(frames[1].buttons.to_bytes(), [0, 0, 0]);
    assert_eq!(frames[2], frames[0]);
    assert_eq!(frames[3], frames[1]);
}

#[test]
fn loops_nest_recursively() {
    let text = "LOOP 2\n\tLOOP 3\n\t\tB 0.1s\n\t\t0.1s\n";
    let frames = parse_macro(text).unwrap();
    // 2 * 3 presses plus 2 * 3 waits
    assert_eq!(frames.len(), 12);
    let total: Duration = frames.iter().map(|frame| frame.duration).sum();
    assert_eq!(total, Duration::from_millis(1200));
}

#[test]
fn loops_detect_space_indents() {
    let four_spaces = parse_macro("LOOP 3\n    A 0.1s").unwrap();
    assert_eq!(four_spaces.len(), 3);
    let two_spaces = parse_macro("LOOP 3\n  A 0.1s").unwrap();
    assert_eq!(two_spaces.len(), 3);
}

#[test]
fn lines_after_a_loop_body_run_once() {
    let frames = parse_macro("LOOP 2\n\tA 0.1s\nB 0.3s").unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2].buttons.to_bytes(), [0x04, 0, 0]);
}

#[test]
fn malformed_macros_are_rejected() {
    assert!(matches!(
        parse_macro("A"),
        Err(MacroError::BadDuration { line: 1 })
    ));
    assert!(matches!(
        parse_macro("A 0.1"),
        Err(MacroError::BadDuration { .. })
    ));
    assert!(matches!(
        parse_macro("NOT_A_BUTTON 0.1s"),
        Err(MacroError::UnknownToken { .. })
    ));
    assert!(matches!(
        parse_macro("LOOP"),
        Err(MacroError::BadLoopHeader { .. })
    ));
    assert!(matches!(
        parse_macro("LOOP 2"),
        Err(MacroError::MissingLoopBody { .. })
    ));
    assert!(matches!(
        parse_macro("L_STICK@+1000 0.1s"),
        Err(MacroError::BadStickPosition { .. })
    ));
    assert!(matches!(
        parse_macro("L_STICK@+200+000 0.1s"),
        Err(MacroError::BadStickPosition { .. })
    ));
}

#[test]
fn stick_tokens_pack_calibrated_positions() {
    let frames = parse_macro("L_STICK@+100+000 0.1s").unwrap();
    // ux = 2159 + 1517 = 3676 = 0xE5C, uy = 1916 = 0x77C
    assert_eq!(frames[0].left_stick, Some([0x5C, 0xCE, 0x77]));
    assert_eq!(frames[0].right_stick, None);

    let frames = parse_macro("R_STICK@-050+100 2s").unwrap();
    let expected = stick_position(Stick::Right, -0.5, 1.0);
    assert_eq!(frames[0].right_stick, Some(expected));
}

#[test]
fn stick_packing_round_trips_within_one_percent() {
    for stick in [Stick::Left, Stick::Right] {
        for rx in [-1.0f64, -0.5, 0.0, 0.5, 1.0] {
            for ry in [-1.0f64, -0.5, 0.0, 0.5, 1.0] {
                let packed = stick_position(stick, rx, ry);
                let (ux, uy) = stick_ratios(stick, packed);
                assert!(
                    (ux - rx).abs() <= 0.01 && (uy - ry).abs() <= 0.01,
                    "{stick:?} ({rx}, {ry}) -> {packed:?} -> ({ux}, {uy})"
                );
            }
        }
    }
}

#[test]
fn scheduler_holds_frames_for_their_duration() {
    let mut parser = InputParser::new();
    parser.buffer_macro("A 0.5s\n0.5s", "m1");
    let start = Instant::now();

    let frame = parser.poll(None, start).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);

    // Still held before the deadline
    let frame = parser.poll(None, start + Duration::from_millis(400)).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);

    // Past the deadline the frame is applied one last time, then retired
    let frame = parser.poll(None, start + Duration::from_millis(600)).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);

    // The wait line holds nothing
    let frame = parser.poll(None, start + Duration::from_millis(700)).unwrap();
    assert_eq!(frame.buttons, [0, 0, 0]);
    assert!(parser.take_finished().is_empty());

    // Wait line expires and the macro completes
    parser.poll(None, start + Duration::from_millis(1300));
    assert_eq!(parser.take_finished(), vec!["m1".to_string()]);
    assert!(parser.poll(None, start + Duration::from_millis(1400)).is_none());
}

#[test]
fn macros_run_in_arrival_order() {
    let mut parser = InputParser::new();
    parser.buffer_macro("A 0.0s", "first");
    parser.buffer_macro("B 0.0s", "second");
    let start = Instant::now();

    let frame = parser.poll(None, start).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);
    // A zero-duration frame still gets one final application on expiry
    let frame = parser.poll(None, start + Duration::from_millis(10)).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);
    let frame = parser.poll(None, start + Duration::from_millis(20)).unwrap();
    assert_eq!(frame.buttons, [0x04, 0, 0]);
    parser.poll(None, start + Duration::from_millis(30));
    assert_eq!(
        parser.take_finished(),
        vec!["first".to_string(), "second".to_string()]
    );
}

#[test]
fn empty_macro_finishes_instantly_without_output() {
    let mut parser = InputParser::new();
    parser.buffer_macro("", "empty");
    assert!(parser.poll(None, Instant::now()).is_none());
    assert_eq!(parser.take_finished(), vec!["empty".to_string()]);
}

#[test]
fn unparseable_macro_finishes_instead_of_wedging_the_queue() {
    let mut parser = InputParser::new();
    parser.buffer_macro("NOT_A_BUTTON 1.0s", "bad");
    parser.buffer_macro("A 0.0s", "good");
    let frame = parser.poll(None, Instant::now()).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);
    assert_eq!(parser.take_finished(), vec!["bad".to_string()]);
}

#[test]
fn direct_input_overrides_the_running_macro_line() {
    let mut parser = InputParser::new();
    parser.buffer_macro("A 10.0s\nB 0.1s", "m1");
    let start = Instant::now();
    let frame = parser.poll(None, start).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);

    let mut packet = InputPacket::default();
    packet.x = true;
    packet.l_stick.x_value = 100;
    let frame = parser
        .poll(Some(&packet), start + Duration::from_millis(10))
        .unwrap();
    assert_eq!(frame.buttons, [0x02, 0, 0]);
    assert_eq!(frame.left_stick, Some([0x5C, 0xCE, 0x77]));

    // The interrupted line is discarded; playback resumes on the next line
    let frame = parser.poll(None, start + Duration::from_millis(20)).unwrap();
    assert_eq!(frame.buttons, [0x04, 0, 0]);
}

#[test]
fn idle_direct_input_is_no_direct_input() {
    let mut parser = InputParser::new();
    parser.buffer_macro("A 1.0s", "m1");
    let idle = InputPacket::default();
    assert!(idle.is_idle());
    let frame = parser.poll(Some(&idle), Instant::now()).unwrap();
    assert_eq!(frame.buttons, [0x08, 0, 0]);
}

#[test]
fn stop_macro_reports_finished_in_every_case() {
    let mut parser = InputParser::new();
    let start = Instant::now();

    // Running macro
    parser.buffer_macro("A 10.0s", "running");
    parser.poll(None, start);
    parser.stop_macro("running");
    assert!(parser.poll(None, start + Duration::from_millis(10)).is_none());

    // Queued macro
    parser.buffer_macro("B 10.0s", "queued");
    parser.stop_macro("queued");
    assert!(parser.poll(None, start + Duration::from_millis(20)).is_none());

    // Unknown id still wakes waiters
    parser.stop_macro("nonexistent");

    assert_eq!(
        parser.take_finished(),
        vec![
            "running".to_string(),
            "queued".to_string(),
            "nonexistent".to_string()
        ]
    );
}

#[test]
fn clear_macros_drops_everything_silently() {
    let mut parser = InputParser::new();
    parser.buffer_macro("A 10.0s", "m1");
    parser.buffer_macro("B 10.0s", "m2");
    parser.poll(None, Instant::now());
    assert!(parser.pending());
    parser.clear_macros();
    assert!(!parser.pending());
    assert!(parser.poll(None, Instant::now()).is_none());
    // Deliberately no finished ids: see the method docs
    assert!(parser.take_finished().is_empty());
}

#[test]
fn repair_frames_press_the_pairing_buttons() {
    let pro = repair_frames(ControllerKind::ProController);
    assert_eq!(pro.len(), 1);
    // L + R
    assert_eq!(pro[0].buttons.to_bytes(), [0x40, 0x00, 0x40]);
    assert_eq!(pro[0].duration, Duration::ZERO);

    let left = repair_frames(ControllerKind::JoyConL);
    // JCL_SL + JCL_SR
    assert_eq!(left[0].buttons.to_bytes(), [0x30, 0x00, 0x00]);

    let right = repair_frames(ControllerKind::JoyConR);
    // JCR_SL + JCR_SR
    assert_eq!(right[0].buttons.to_bytes(), [0x00, 0x00, 0x30]);
}

#[test]
fn preloaded_frames_run_without_a_finished_id() {
    let mut parser = InputParser::new();
    parser.preload_frames(repair_frames(ControllerKind::ProController));
    let start = Instant::now();
    let frame = parser.poll(None, start).unwrap();
    assert_eq!(frame.buttons, [0x40, 0x00, 0x40]);
    parser.poll(None, start + Duration::from_millis(10));
    assert!(parser.take_finished().is_empty());
}

#[test]
fn packets_serialize_with_the_wire_field_names() {
    let mut packet = InputPacket::default();
    packet.a = true;
    packet.l_stick.x_value = 75;
    packet.r_stick.up = true;
    let json = serde_json::to_string(&packet).unwrap();
    assert!(json.contains("\"A\":true"));
    assert!(json.contains("\"L_STICK\""));
    assert!(json.contains("\"X_VALUE\":75"));
    assert!(json.contains("\"RS_UP\":true"));

    let parsed: InputPacket = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, packet);
    assert!(!parsed.is_idle());

    // Partial packets fill in idle defaults
    let parsed: InputPacket = serde_json::from_str("{\"B\": true}").unwrap();
    assert!(parsed.b);
    assert!(!parsed.a);
}
