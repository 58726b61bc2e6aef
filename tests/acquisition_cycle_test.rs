//! End-to-end buffer cycling against the simulated board.
//!
//! Covers pool growth, FIFO ordering across both queues, the CPU/device
//! ownership hand-off, and ownership exclusivity under concurrent consumers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dragon_daq::error::{AllocError, SubmitError};
use dragon_daq::hardware::mock::{parse_frame_header, MockBoard};
use dragon_daq::{ActivityState, DeviceOptions, DragonDevice, DragonError, QueueKind};
use dragon_regs::{DeviceFamily, Register};
use parking_lot::Mutex;
use rand::Rng;

fn fast_options() -> DeviceOptions {
    DeviceOptions {
        reset_pulse: Duration::from_millis(1),
        ..Default::default()
    }
}

/// Opens a legacy session with one-page buffers (90-byte frames, 10 per buffer).
fn open(board: &MockBoard) -> DragonDevice {
    let dev = board.device(fast_options());
    dev.open_session().unwrap();
    let mut p = dev.query_params();
    p.frame_length = 90;
    p.frames_per_buffer = 10;
    dev.set_params(&p).unwrap();
    dev
}

#[test]
fn test_fresh_session_consume_is_empty() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    assert!(matches!(dev.consume(), Err(DragonError::Empty)));
    assert_eq!(dev.state(), ActivityState::Inactive);
}

#[test]
fn test_request_buffers_is_idempotent() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    assert_eq!(dev.request_buffers(4).unwrap(), 4);
    assert_eq!(dev.request_buffers(4).unwrap(), 4);
    assert_eq!(dev.request_buffers(1).unwrap(), 4);
    assert_eq!(board.dma().live_allocations(), 4);

    let addresses: HashSet<u64> = (0..4)
        .map(|i| dev.query_buffer(i).unwrap().device_address)
        .collect();
    assert_eq!(addresses.len(), 4);
    assert!(matches!(
        dev.query_buffer(4),
        Err(DragonError::InvalidIndex { index: 4, capacity: 4 })
    ));
}

#[test]
fn test_capacity_ceiling() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    dev.request_buffers(2).unwrap();
    let err = dev.request_buffers(513).unwrap_err();
    assert!(matches!(
        err,
        DragonError::Alloc(AllocError::TooMany { requested: 513, max: 512 })
    ));
    assert_eq!(dev.buffer_count(), 2);
}

#[test]
fn test_partial_allocation_is_usable() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    board.dma().fail_alloc_after(2);
    assert!(matches!(
        dev.request_buffers(6),
        Err(DragonError::Alloc(AllocError::OutOfMemory { available: 2 }))
    ));
    assert_eq!(dev.buffer_count(), 2);

    dev.activate().unwrap();
    dev.submit(1).unwrap();
    board.complete_next(&dev.irq_handle()).unwrap();
    assert_eq!(dev.consume().unwrap().index, 1);
}

#[test]
fn test_submit_requires_active() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    dev.request_buffers(1).unwrap();
    assert!(matches!(
        dev.submit(0),
        Err(DragonError::Submit(SubmitError::NotActive))
    ));
    assert!(board.regs().writes_to(Register::SubmitAddress).is_empty());
    assert_eq!(dev.is_cpu_owned(0), Some(true));
}

#[test]
fn test_fifo_order_through_both_queues() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    dev.request_buffers(5).unwrap();
    dev.activate().unwrap();

    for i in [3, 1, 4] {
        dev.submit(i).unwrap();
    }
    assert_eq!(dev.queued(QueueKind::Ready), vec![3, 1, 4]);

    let expected: Vec<u32> = [3, 1, 4]
        .iter()
        .map(|&i| dev.query_buffer(i).unwrap().device_address as u32)
        .collect();
    assert_eq!(board.regs().writes_to(Register::SubmitAddress), expected);

    assert_eq!(board.complete_many(&dev.irq_handle(), 3), 3);
    assert_eq!(dev.queued(QueueKind::Done), vec![3, 1, 4]);
    let order: Vec<usize> = (0..3).map(|_| dev.consume().unwrap().index).collect();
    assert_eq!(order, vec![3, 1, 4]);
    assert!(matches!(dev.consume(), Err(DragonError::Empty)));
}

#[test]
fn test_ownership_follows_queue() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    dev.request_buffers(1).unwrap();
    let addr = dev.query_buffer(0).unwrap().device_address;
    dev.activate().unwrap();

    assert_eq!(dev.is_cpu_owned(0), Some(true));
    dev.submit(0).unwrap();
    assert_eq!(dev.is_cpu_owned(0), Some(false));
    assert_eq!(board.dma().device_syncs(addr), 1);
    assert_eq!(board.dma().cpu_syncs(addr), 0);

    board.complete_next(&dev.irq_handle()).unwrap();
    assert_eq!(dev.is_cpu_owned(0), Some(false));

    dev.consume().unwrap();
    assert_eq!(dev.is_cpu_owned(0), Some(true));
    assert_eq!(board.dma().cpu_syncs(addr), 1);

    dev.submit(0).unwrap();
    assert_eq!(board.dma().device_syncs(addr), 2);
}

#[test]
fn test_consumed_buffer_holds_device_data() {
    let board = MockBoard::new(DeviceFamily::Legacy);
    let dev = open(&board);
    dev.request_buffers(2).unwrap();
    dev.activate().unwrap();
    dev.submit(1).unwrap();
    dev.submit(0).unwrap();
    board.complete_many(&dev.irq_handle(), 2);

    for expected_seq in 0..2u32 {
        let d = dev.consume().unwrap();
        let mapping = dev.map_buffer(d.offset, d.length).unwrap();
        assert_eq!(mapping.index(), d.index);
        // SAFETY: consumed and not resubmitted; the pool outlives the read.
        let data = unsafe { mapping.as_slice() };
        let (seq, addr) = parse_frame_header(data).unwrap();
        assert_eq!(seq, expected_seq);
        assert_eq!(u64::from(addr), d.device_address);
    }
}

#[test]
fn test_no_double_ownership_under_contention() {
    const BUFFERS: usize = 8;
    const CONSUMERS: usize = 4;
    const TARGET: usize = 2_000;

    let board = Arc::new(MockBoard::new(DeviceFamily::Legacy));
    let dev = open(&board);
    dev.request_buffers(BUFFERS).unwrap();
    dev.activate().unwrap();
    for i in 0..BUFFERS {
        dev.submit(i).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let completer = {
        let (board, irq, stop) = (Arc::clone(&board), dev.irq_handle(), Arc::clone(&stop));
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            while !stop.load(Ordering::Acquire) {
                board.complete_next(&irq);
                if rng.gen_bool(0.3) {
                    thread::yield_now();
                }
            }
        })
    };

    let held = Arc::new(Mutex::new(HashSet::new()));
    let consumed = Arc::new(AtomicUsize::new(0));
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let (dev, held, consumed) = (dev.clone(), Arc::clone(&held), Arc::clone(&consumed));
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while consumed.load(Ordering::Acquire) < TARGET {
                    match dev.consume() {
                        Ok(d) => {
                            assert!(held.lock().insert(d.index), "buffer {} owned twice", d.index);
                            assert_eq!(dev.is_cpu_owned(d.index), Some(true));
                            if rng.gen_bool(0.2) {
                                thread::sleep(Duration::from_micros(rng.gen_range(1..50)));
                            }
                            assert!(held.lock().remove(&d.index));
                            dev.submit(d.index).unwrap();
                            consumed.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(DragonError::Empty) => {
                            dev.wait_readable(Some(Duration::from_millis(5)));
                        }
                        Err(e) => panic!("unexpected consume error: {e}"),
                    }
                }
            })
        })
        .collect();

    for c in consumers {
        c.join().unwrap();
    }
    // Let the board finish everything still queued, then stop it.
    while !dev.queued(QueueKind::Ready).is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Release);
    completer.join().unwrap();

    dev.deactivate().unwrap();
    assert!(held.lock().is_empty());
    assert_eq!(dev.in_flight(), 0);

    let done = dev.queued(QueueKind::Done);
    assert_eq!(done.len(), BUFFERS);
    for &i in &done {
        assert_eq!(dev.is_cpu_owned(i), Some(false));
    }

    let stats = dev.stats();
    assert_eq!(stats.submitted, stats.completed);
    assert_eq!(stats.consumed + BUFFERS as u64, stats.completed);
    assert!(stats.consumed >= TARGET as u64);
}
