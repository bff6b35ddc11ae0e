use gpdevboard::part::bitstream_osc_trim;
use gpdevboard::sim::SimBoard;
use gpdevboard::{
    classify_bitstream, detect_part, test_setup, verify_device_present, BitstreamKind, DevBoard,
    DevboardError, Part, SetupOptions, SetupStage, TrimSettings,
};

fn programmed(part: Part, pattern_id: u8) -> Vec<u8> {
    let layout = part.layout().unwrap();
    let mut bs: Vec<u8> = (0..layout.len).map(|i| (i * 13 + 1) as u8).collect();
    bs[layout.marker_offset] = layout.marker;
    gpdevboard::tweak_bitstream(&mut bs, part, 0x80, pattern_id, false).unwrap();
    bs
}

fn options(part: Part, rc_osc_freq: Option<u32>) -> SetupOptions {
    SetupOptions {
        part,
        supply_voltage: 3.3,
        rc_osc_freq,
        trim: TrimSettings::default(),
    }
}

#[test]
fn empty_socket() {
    let mut board = DevBoard::new(SimBoard::new());
    assert!(matches!(
        detect_part(&mut board),
        Err(DevboardError::NoPartDetected)
    ));
}

#[test]
fn detects_blank_slg46140() {
    let mut board = DevBoard::new(SimBoard::with_part(Part::Slg46140v, vec![0; 128]));
    let detection = detect_part(&mut board).unwrap();
    assert_eq!(detection.part, Part::Slg46140v);
    assert_eq!(detection.kind, BitstreamKind::Empty);
    assert_eq!(board.part(), Some(Part::Slg46140v));
}

#[test]
fn detects_programmed_slg46620() {
    let nvram = programmed(Part::Slg46620v, 0x42);
    let mut board = DevBoard::new(SimBoard::with_part(Part::Slg46620v, nvram.clone()));
    let detection = detect_part(&mut board).unwrap();
    assert_eq!(detection.part, Part::Slg46620v);
    assert_eq!(detection.kind, BitstreamKind::Programmed { pattern_id: 0x42 });
    assert_eq!(detection.bitstream, nvram);
    assert_eq!(board.transport().selected_part(), Some(Part::Slg46620v));
}

#[test]
fn tells_slg46621_apart() {
    let mut board = DevBoard::new(SimBoard::with_part(Part::Slg46621v, vec![0; 256]));
    assert_eq!(detect_part(&mut board).unwrap().part, Part::Slg46621v);
    // pin 14 goes back to floating afterwards
    assert_eq!(board.transport().drive_code(14), 0x0200);
}

#[test]
fn verify_rejects_other_variant() {
    let mut board = DevBoard::new(SimBoard::with_part(Part::Slg46621v, vec![0; 256]));
    assert!(matches!(
        verify_device_present(&mut board, Part::Slg46620v),
        Err(DevboardError::WrongPart {
            expected: Part::Slg46620v,
            detected: Part::Slg46621v,
        })
    ));

    let mut board = DevBoard::new(SimBoard::with_part(Part::Slg46621v, vec![0; 256]));
    verify_device_present(&mut board, Part::Slg46621v).unwrap();
}

#[test]
fn setup_trims_and_patches() {
    let image = programmed(Part::Slg46620v, 0x17);
    let board = DevBoard::new(SimBoard::with_part(Part::Slg46620v, vec![0; 256]));

    let ready = test_setup(board, image.clone(), &options(Part::Slg46620v, Some(25_000))).unwrap();
    let ftw = ready.osc_trim.unwrap();
    assert!((15_000 + u32::from(ftw) * 80).abs_diff(25_000) <= 50);
    assert_eq!(ready.detection.part, Part::Slg46620v);

    assert_eq!(bitstream_osc_trim(Part::Slg46620v, &ready.bitstream), Some(ftw));
    assert_eq!(
        classify_bitstream(Part::Slg46620v, &ready.bitstream),
        BitstreamKind::Programmed { pattern_id: 0x17 }
    );
    assert_eq!(ready.board.transport().sram(), &ready.bitstream[..]);
}

#[test]
fn setup_without_trim_loads_image_as_is() {
    let image = programmed(Part::Slg46140v, 0x01);
    let board = DevBoard::new(SimBoard::with_part(Part::Slg46140v, vec![0; 128]));

    let ready = test_setup(board, image.clone(), &options(Part::Slg46140v, None)).unwrap();
    assert_eq!(ready.osc_trim, None);
    assert_eq!(ready.bitstream, image);
    assert_eq!(ready.board.transport().sram(), &image[..]);
}

fn failed_stage(res: Result<impl std::fmt::Debug, DevboardError>) -> (SetupStage, DevboardError) {
    match res {
        Err(DevboardError::SetupFailed { stage, source }) => (stage, *source),
        other => panic!("expected setup failure, got {:?}", other),
    }
}

#[test]
fn setup_reports_failing_stage() {
    let image = programmed(Part::Slg46620v, 0);

    let board = DevBoard::new(SimBoard::with_part(Part::Slg46621v, vec![0; 256]));
    let (stage, source) = failed_stage(
        test_setup(board, image.clone(), &options(Part::Slg46620v, None)).map(|r| r.osc_trim),
    );
    assert_eq!(stage, SetupStage::Verify);
    assert!(matches!(source, DevboardError::WrongPart { .. }));

    let board = DevBoard::new(SimBoard::with_part(Part::Slg46620v, vec![0; 256]));
    let (stage, source) = failed_stage(
        test_setup(board, vec![0; 100], &options(Part::Slg46620v, None)).map(|r| r.osc_trim),
    );
    assert_eq!(stage, SetupStage::Upload);
    assert!(matches!(
        source,
        DevboardError::BitstreamLengthMismatch { actual: 100, .. }
    ));

    let mut sim = SimBoard::with_part(Part::Slg46620v, vec![0; 256]);
    sim.set_fault_flags(0x01);
    let (stage, _) = failed_stage(
        test_setup(DevBoard::new(sim), image.clone(), &options(Part::Slg46620v, None))
            .map(|r| r.osc_trim),
    );
    assert_eq!(stage, SetupStage::Status);

    let mut sim = SimBoard::with_part(Part::Slg46620v, vec![0; 256]);
    sim.fail_send_at(0);
    let (stage, source) = failed_stage(
        test_setup(DevBoard::new(sim), image.clone(), &options(Part::Slg46620v, None))
            .map(|r| r.osc_trim),
    );
    assert_eq!(stage, SetupStage::Reset);
    assert!(matches!(source, DevboardError::UsbTimeout));

    let mut sim = SimBoard::with_part(Part::Slg46620v, vec![0; 256]);
    sim.set_oscillator(40_000, 80);
    let (stage, source) = failed_stage(
        test_setup(DevBoard::new(sim), image, &options(Part::Slg46620v, Some(25_000)))
            .map(|r| r.osc_trim),
    );
    assert_eq!(stage, SetupStage::Trim);
    assert!(matches!(
        source,
        DevboardError::CalibrationDidNotConverge { best_ftw: 0, .. }
    ));
}
