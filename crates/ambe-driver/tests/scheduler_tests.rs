//! Scheduler behavior against virtual transports.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ambe_driver::mock::{MockFifoDevice, MockTaggingDevice};
use ambe_driver::{Device, DriverError, FifoScheduler, MultiQueueScheduler, Scheduler};
use ambe_proto::{field, Packet, PacketType};

use common::{control_frame, wait_until};

fn speech_request(channel: u8) -> Packet {
    let mut packet = Packet::new(PacketType::Speech);
    packet.append_channel(channel).unwrap();
    packet.append_spchd(&[0i16; 160]).unwrap();
    packet.finalize(false);
    packet
}

fn chand_request(channel: u8) -> Packet {
    let mut packet = Packet::new(PacketType::Channel);
    packet.append_channel(channel).unwrap();
    packet.append_chand(&[0u8; 11], 88).unwrap();
    packet.finalize(false);
    packet
}

fn control_request(tag: u8) -> Packet {
    let mut packet = Packet::new(PacketType::Control);
    packet.append_field(tag);
    packet.finalize(false);
    packet
}

#[test]
fn fifo_resolves_responses_by_tag() {
    let device = Arc::new(MockTaggingDevice::new());
    device.set_uses_parity(false);
    let scheduler = FifoScheduler::new(device.clone());
    scheduler.start().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["R1", "R2", "R3"] {
        let order = Arc::clone(&order);
        scheduler.submit_async(
            control_request(field::PRODID),
            Box::new(move |result| {
                result.unwrap();
                order.lock().unwrap().push(name);
            }),
        );
    }

    let tags: Vec<i32> = device.sent().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, [1, 2, 3]);

    // The gateway may reorder responses between clients; tags pair them up.
    for tag in [2, 1, 3] {
        device.respond(tag, control_frame(&[field::PRODID, 0], false));
    }
    assert_eq!(*order.lock().unwrap(), ["R2", "R1", "R3"]);

    scheduler.stop().unwrap();
}

#[test]
fn fifo_drops_unknown_tags() {
    let device = Arc::new(MockTaggingDevice::new());
    device.set_uses_parity(false);
    let scheduler = FifoScheduler::new(device.clone());
    scheduler.start().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    scheduler.submit_async(
        control_request(field::PRODID),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // Nobody asked for tag 99; the response is logged and dropped.
    device.respond(99, control_frame(&[field::PRODID, 0], false));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    device.respond(1, control_frame(&[field::PRODID, 0], false));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    scheduler.stop().unwrap();
}

#[test]
fn fifo_send_error_resolves_callback_with_error() {
    let device = Arc::new(MockTaggingDevice::new());
    device.set_uses_parity(false);
    let scheduler = FifoScheduler::new(device.clone());
    scheduler.start().unwrap();

    device.fail_sends(true);
    let result = scheduler.submit(control_request(field::PRODID)).wait();
    assert!(matches!(result, Err(DriverError::DeviceSendFailed { .. })));

    // The failed request was never recorded, so stop has nothing to wait
    // for.
    assert!(device.sent().is_empty());
    scheduler.stop().unwrap();
}

#[test]
fn fifo_stop_waits_for_outstanding_requests() {
    let device = Arc::new(MockTaggingDevice::new());
    device.set_uses_parity(false);
    let scheduler = FifoScheduler::new(device.clone());
    scheduler.start().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    scheduler.submit_async(
        control_request(field::PRODID),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let responder = Arc::clone(&device);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        responder.respond(1, control_frame(&[field::PRODID, 0], false));
    });

    scheduler.stop().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    handle.join().unwrap();
}

#[test]
fn multiqueue_admission_bounds() {
    let device = Arc::new(MockFifoDevice::new(3));
    device.set_uses_parity(false);
    let scheduler = MultiQueueScheduler::new(device.clone(), 3).unwrap();
    scheduler.start().unwrap();

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let mut submitted = 0usize;
    for channel in 0..3u8 {
        for seq in 0..7usize {
            for (kind, packet) in [(0usize, speech_request(channel)), (1, chand_request(channel))]
            {
                let delivered = Arc::clone(&delivered);
                scheduler.submit_async(
                    packet,
                    Box::new(move |result| {
                        result.unwrap();
                        delivered.lock().unwrap().push((channel, kind, seq));
                    }),
                );
                submitted += 1;
            }
        }
    }

    // Steady state: 2 per channel queue would allow 12 in flight, but the
    // per-type bound (N + 2 = 5 each) caps it at the total bound 2N + 4.
    assert!(wait_until(Duration::from_secs(2), || device.sent_count() == 10));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(device.sent_count(), 10);

    let in_flight = device.sent();
    let speech = in_flight.iter().filter(|p| p[3] == 0x02).count();
    let chand = in_flight.iter().filter(|p| p[3] == 0x01).count();
    assert_eq!(speech, 5);
    assert_eq!(chand, 5);
    for channel_tag in [field::CHANNEL0, field::CHANNEL1, field::CHANNEL2] {
        for kind in [0x01u8, 0x02] {
            let per_queue = in_flight
                .iter()
                .filter(|p| p[3] == kind && p[4] == channel_tag)
                .count();
            assert!(per_queue <= 2, "queue ({channel_tag:#x}, {kind}) over limit");
        }
    }

    // Every response frees one slot; the bounds must hold at every step.
    let mut responded = 0usize;
    while responded < submitted {
        assert!(wait_until(Duration::from_secs(2), || device.sent_count()
            > responded));
        assert!(device.sent_count() - responded <= 10);
        device.push_response(control_frame(&[field::READY], false));
        responded += 1;
    }

    assert!(wait_until(Duration::from_secs(2), || delivered
        .lock()
        .unwrap()
        .len()
        == submitted));
    assert_eq!(device.sent_count(), submitted);

    // Per-queue order: responses for any one queue arrive in submission
    // order, and every request was resolved exactly once.
    let delivered = delivered.lock().unwrap();
    for channel in 0..3u8 {
        for kind in 0..2usize {
            let seqs: Vec<usize> = delivered
                .iter()
                .filter(|(c, k, _)| *c == channel && *k == kind)
                .map(|(_, _, seq)| *seq)
                .collect();
            assert_eq!(seqs, (0..7).collect::<Vec<_>>());
        }
    }

    scheduler.stop().unwrap();
}

#[test]
fn multiqueue_device_queue_has_priority() {
    let device = Arc::new(MockFifoDevice::new(3));
    device.set_uses_parity(false);
    let scheduler = MultiQueueScheduler::new(device.clone(), 3).unwrap();
    scheduler.start().unwrap();

    // Fill the speech queues of channels 1 and 2 beyond their pipeline
    // slots; two per queue go out, the rest wait.
    for channel in [1u8, 2] {
        for _ in 0..3 {
            scheduler.submit_async(speech_request(channel), Box::new(|_| {}));
        }
    }
    assert!(wait_until(Duration::from_secs(2), || device.sent_count() == 4));

    // A device-wide control packet overtakes all queued channel traffic.
    scheduler.submit_async(control_request(field::PRODID), Box::new(|_| {}));
    assert!(wait_until(Duration::from_secs(2), || device.sent_count() == 5));

    let sent = device.sent();
    assert_eq!(sent[4][3], 0x00);
    assert_eq!(sent[4][4], field::PRODID);

    // Unblock everything so stop can drain.
    for _ in 0..7 {
        device.push_response(control_frame(&[field::READY], false));
    }
    scheduler.stop().unwrap();
}

#[test]
fn multiqueue_stop_drains_outstanding_work() {
    let device = Arc::new(MockFifoDevice::new(3));
    device.set_uses_parity(false);
    device.set_responder(Some(Box::new(|_| Some(control_frame(&[field::READY], false)))));
    let scheduler = MultiQueueScheduler::new(device.clone(), 3).unwrap();
    scheduler.start().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let counter = Arc::clone(&fired);
        scheduler.submit_async(
            speech_request(0),
            Box::new(move |result| {
                result.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    scheduler.stop().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 5);
    assert_eq!(device.sent_count(), 5);
}

#[test]
fn multiqueue_send_failure_is_fatal() {
    let device = Arc::new(MockFifoDevice::new(3));
    device.set_uses_parity(false);
    device.fail_sends(true);
    let scheduler = MultiQueueScheduler::new(device.clone(), 3).unwrap();
    scheduler.start().unwrap();

    let result = scheduler.submit(speech_request(0)).wait();
    assert!(matches!(result, Err(DriverError::DeviceSendFailed { .. })));

    // The scheduling thread is gone; later submissions fail immediately
    // and stop reports the failure.
    let result = scheduler.submit(speech_request(0)).wait();
    assert!(matches!(result, Err(DriverError::DeviceSendFailed { .. })));
    assert!(scheduler.stop().is_err());
}

#[test]
fn fifo_link_loss_fails_outstanding_and_unblocks_stop() {
    let device = Arc::new(MockTaggingDevice::new());
    device.set_uses_parity(false);
    let scheduler = FifoScheduler::new(device.clone());
    scheduler.start().unwrap();

    let pending = scheduler.submit(control_request(field::PRODID));
    assert_eq!(device.sent().len(), 1);

    // The gateway dies while stop is draining; stop must not hang.
    let dying = Arc::clone(&device);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        dying.drop_link("gateway connection reset");
    });

    scheduler.stop().unwrap();
    handle.join().unwrap();

    let result = pending.wait();
    assert!(matches!(result, Err(DriverError::DeviceLinkLost { .. })));
}

#[test]
fn multiqueue_link_loss_fails_outstanding_and_queued_requests() {
    let device = Arc::new(MockFifoDevice::new(3));
    device.set_uses_parity(false);
    let scheduler = MultiQueueScheduler::new(device.clone(), 3).unwrap();
    scheduler.start().unwrap();

    // Two fill the pipeline slots of (0, speech); the third stays queued.
    let pending: Vec<_> = (0..3)
        .map(|_| scheduler.submit(speech_request(0)))
        .collect();
    assert!(wait_until(Duration::from_secs(2), || device.sent_count() == 2));

    device.drop_link("serial adapter unplugged");

    // Exactly one resolution per request, in flight or still queued.
    for response in pending {
        let result = response.wait();
        assert!(matches!(result, Err(DriverError::DeviceLinkLost { .. })));
    }

    // The scheduling thread is gone; stop reports the failure instead of
    // hanging.
    assert!(scheduler.stop().is_err());
}

#[test]
fn multiqueue_rejects_out_of_range_channels() {
    let device = Arc::new(MockFifoDevice::new(1));
    device.set_uses_parity(false);
    let scheduler = MultiQueueScheduler::new(device.clone(), 1).unwrap();
    scheduler.start().unwrap();

    let result = scheduler.submit(speech_request(2)).wait();
    assert!(matches!(
        result,
        Err(DriverError::InvalidConfiguration { .. })
    ));

    scheduler.stop().unwrap();
}

#[test]
fn multiqueue_channel_count_is_validated() {
    let device = Arc::new(MockFifoDevice::new(3));
    assert!(MultiQueueScheduler::new(device.clone(), 0).is_err());
    assert!(MultiQueueScheduler::new(device, 4).is_err());
}
