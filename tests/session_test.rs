//! Device manager sessions and configuration-driven setup.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use dragon_daq::hardware::mock::MockBoard;
use dragon_daq::{ActivityState, DeviceManager, DragonConfig, DragonError};
use dragon_regs::{DeviceFamily, Register};
use serial_test::serial;
use tempfile::NamedTempFile;

fn fast_config() -> DragonConfig {
    DragonConfig {
        reset_pulse_ms: 1,
        ..Default::default()
    }
}

fn manager_with_board(config: DragonConfig) -> (DeviceManager, Arc<MockBoard>, u32) {
    let board = Arc::new(MockBoard::new(config.family));
    let manager = DeviceManager::new(config);
    let minor = manager
        .register(board.regs().clone(), board.dma().clone())
        .unwrap();
    (manager, board, minor)
}

#[test]
fn test_open_programs_factory_defaults() {
    let (manager, board, minor) = manager_with_board(fast_config());
    let session = manager.open(minor).unwrap();

    let regs = board.regs();
    assert_eq!(regs.value(Register::FrameLength), Some(49140 / 6 - 1));
    assert_eq!(regs.value(Register::FramesPerBuffer), Some(60 * 49140 / 90));
    assert_eq!(regs.value(Register::Misc), Some(50));
    assert!(regs.value(Register::SwitchPeriod).is_some());
    assert_eq!(session.query_params().frames_per_buffer, 60);
}

#[test]
fn test_second_open_is_rejected() {
    let (manager, _board, minor) = manager_with_board(fast_config());
    let _session = manager.open(minor).unwrap();
    match manager.open(minor) {
        Err(DragonError::DeviceBusy(name)) => assert_eq!(name, "dragon0"),
        other => panic!("expected DeviceBusy, got {other:?}"),
    }
}

#[test]
fn test_close_while_active_resets_and_releases() {
    let (manager, board, minor) = manager_with_board(fast_config());
    {
        let session = manager.open(minor).unwrap();
        let mut p = session.query_params();
        p.frame_length = 900;
        p.frames_per_buffer = 4;
        session.set_params(&p).unwrap();
        session.request_buffers(3).unwrap();
        session.activate().unwrap();
        session.submit(0).unwrap();
        session.submit(2).unwrap();
        assert_eq!(board.dma().live_allocations(), 3);
    }

    assert_eq!(board.dma().live_allocations(), 0);
    assert_eq!(board.dma().live_mappings(), 0);
    assert_eq!(board.dma().pinned_count(), 0);
    assert_eq!(board.regs().pending_submissions(), 0);
    assert_eq!(board.regs().value(Register::Enable), Some(0));

    // A new session starts from factory parameters with a full register write.
    board.regs().clear_writes();
    let session = manager.open(minor).unwrap();
    assert_eq!(session.state(), ActivityState::Inactive);
    assert_eq!(session.buffer_count(), 0);
    assert_eq!(session.query_params().frame_length, 49140);
    assert_eq!(board.regs().writes_to(Register::FrameLength), vec![8189]);
}

#[test]
fn test_release_then_regrow() {
    let (manager, _board, minor) = manager_with_board(fast_config());
    let session = manager.open(minor).unwrap();
    let mut p = session.query_params();
    p.frame_length = 90;
    p.frames_per_buffer = 1;
    session.set_params(&p).unwrap();

    session.request_buffers(2).unwrap();
    session.release_buffers().unwrap();
    session.release_buffers().unwrap();
    assert_eq!(session.buffer_count(), 0);
    assert!(matches!(
        session.query_buffer(0),
        Err(DragonError::InvalidIndex { index: 0, capacity: 0 })
    ));

    assert_eq!(session.request_buffers(3).unwrap(), 3);
    session.activate().unwrap();
    session.submit(2).unwrap();
}

#[test]
fn test_dac_and_device_id_through_session() {
    let (manager, board, minor) = manager_with_board(fast_config());
    let session = manager.open(minor).unwrap();
    session.set_dac(0x1122_3344);
    assert_eq!(board.regs().value(Register::Dac), Some(0x1122_3344));
    assert_eq!(
        session.device_id(),
        dragon_daq::hardware::mock::MOCK_DEVICE_ID
    );
}

#[test]
#[serial]
fn test_config_file_and_env_select_family() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "family = \"legacy\"\nreset_pulse_ms = 1").unwrap();

    std::env::set_var("DRAGON_FAMILY", "packet120");
    std::env::set_var("DRAGON_DRAIN_TIMEOUT_MS", "25");
    let config = DragonConfig::load_from(file.path());
    std::env::remove_var("DRAGON_FAMILY");
    std::env::remove_var("DRAGON_DRAIN_TIMEOUT_MS");
    let config = config.unwrap();

    assert_eq!(config.family, DeviceFamily::Packet120);
    assert_eq!(config.drain_timeout(), Some(Duration::from_millis(25)));

    let (manager, board, minor) = manager_with_board(config);
    let session = manager.open(minor).unwrap();
    assert_eq!(session.family(), DeviceFamily::Packet120);
    assert_eq!(board.regs().value(Register::PulseMask), Some(0));
    assert_eq!(board.regs().value(Register::SwitchPeriod), None);
    assert_eq!(session.query_params().frame_length, 49200);

    let mut p = session.query_params();
    p.frame_length = 121;
    assert_eq!(session.set_params(&p).unwrap().frame_length, 240);

    // Drain timeout from the environment bounds deactivation.
    session.request_buffers(1).unwrap();
    session.activate().unwrap();
    session.submit(0).unwrap();
    session.deactivate().unwrap();
    assert_eq!(session.stats().discarded, 1);
}
