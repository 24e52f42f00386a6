//! API behavior against a virtual chip.

mod common;

use std::sync::Arc;

use ambe_driver::mock::{MockFifoDevice, Responder};
use ambe_driver::{Api, Device, DriverError, MultiQueueScheduler, Scheduler};
use ambe_proto::{field, ModeFlags, Rate};

use common::{control_frame, frame};

/// A responder that behaves like a freshly configured chip: status echoes
/// for control requests, fixed data for speech and channel data requests.
fn chip_responder(parity: bool) -> Responder {
    Box::new(move |packet: &[u8]| {
        // A hardware reset announces readiness with a parity field, like
        // the real chip after power-up.
        if packet.is_empty() {
            return Some(control_frame(&[field::READY], true));
        }
        // Zero filler bytes are not packets; the chip swallows them.
        if packet.first() != Some(&0x61) {
            return None;
        }

        let payload = &packet[4..];
        match packet[3] {
            // Control: rate and init requests get the channel status
            // prefix, everything else a plain status field.
            0x00 => match payload.first() {
                Some(&tag) if field::channel_of(tag).is_some() => {
                    let command = payload[1];
                    if matches!(command, field::RATET | field::RATEP | field::INIT) {
                        Some(control_frame(&[tag, 0, command, 0], parity))
                    } else {
                        Some(control_frame(&[command, 0], parity))
                    }
                }
                Some(&field::RESET) => Some(control_frame(&[field::READY], true)),
                Some(&field::PRODID) => {
                    Some(control_frame(b"\x30AMBE3003\0", parity))
                }
                Some(&tag) => Some(control_frame(&[tag, 0], parity)),
                None => None,
            },
            // Speech in, bits out.
            0x02 => {
                let mut body = vec![payload[0], field::CHAND, 88];
                body.extend_from_slice(&[0xa5; 11]);
                Some(frame(0x01, &body, parity))
            }
            // Bits in, speech out.
            0x01 => {
                let mut body = vec![payload[0], field::SPCHD, 160];
                body.extend_from_slice(&[0u8; 320]);
                Some(frame(0x02, &body, parity))
            }
            _ => None,
        }
    })
}

struct Harness {
    device: Arc<MockFifoDevice>,
    scheduler: Arc<MultiQueueScheduler>,
    api: Api,
}

fn harness(parity: bool) -> Harness {
    let device = Arc::new(MockFifoDevice::new(3));
    device.set_uses_parity(parity);
    device.set_responder(Some(chip_responder(parity)));
    let scheduler = Arc::new(MultiQueueScheduler::new(device.clone(), 3).unwrap());
    scheduler.start().unwrap();
    let api = Api::new(device.clone(), scheduler.clone(), true);
    Harness {
        device,
        scheduler,
        api,
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.scheduler.stop();
    }
}

#[test]
fn soft_reset_flushes_and_waits_for_ready() {
    let h = harness(false);
    // Pretend the chip was left with parity disabled by a previous run.
    h.device.set_uses_parity(false);

    h.api.reset(false).unwrap();

    let sent = h.device.sent();
    assert_eq!(sent.len(), 351);

    // 350 groups of 10 zero bytes terminate any half-written packet.
    let zeros: usize = sent[..350].iter().map(Vec::len).sum();
    assert_eq!(zeros, 3500);
    assert!(sent[..350].iter().all(|g| g.iter().all(|&b| b == 0)));

    // The RESET packet itself always carries parity so the chip takes it
    // in any state.
    let reset = &sent[350];
    assert_eq!(reset[..5], [0x61, 0x00, 0x03, 0x00, field::RESET]);
    assert_eq!(reset[5], field::PARITY);

    // READY was accepted without parity checking, and the chip is back in
    // its power-up parity mode.
    assert!(h.device.uses_parity());
}

#[test]
fn hard_reset_uses_the_capability_and_restores_the_callback() {
    let h = harness(false);

    h.api.reset(true).unwrap();
    assert!(h.device.was_hard_reset());
    assert!(h.device.uses_parity());

    // The scheduler callback was restored: normal requests still resolve.
    h.device.set_uses_parity(false);
    h.api.compand(false, false).unwrap();
}

#[test]
fn parity_mode_flips_the_flag_before_the_response_is_parsed() {
    let h = harness(true);
    assert!(h.device.uses_parity());

    // The responder answers in the new (parity-less) format. If the flag
    // were still set when the scheduler parses the response, the missing
    // parity field would make the parse fail.
    h.device.set_responder(Some(Box::new(|packet: &[u8]| {
        (packet[3] == 0x00).then(|| control_frame(&[field::PARITYMODE, 0], false))
    })));

    h.api.parity_mode(0).unwrap();
    assert!(!h.device.uses_parity());
}

#[test]
fn channel_commands_validate_the_status_prefix() {
    let h = harness(false);

    h.api.ratet(1, 33).unwrap();
    h.api.ratep(2, &[0x0558, 0x086b, 0x1030, 0, 0, 0x0190]).unwrap();
    h.api.init(0, true, true).unwrap();
    h.api.rate(1, &Rate::Table { index: 33 }).unwrap();

    // A response for the wrong channel is rejected.
    h.device.set_responder(Some(Box::new(|packet: &[u8]| {
        (packet[3] == 0x00).then(|| {
            control_frame(&[field::CHANNEL2, 0, field::RATET, 0], false)
        })
    })));
    let err = h.api.ratet(0, 33).unwrap_err();
    assert!(matches!(err, DriverError::InvalidResponse { .. }));
}

#[test]
fn chip_status_errors_are_surfaced() {
    let h = harness(false);

    h.device.set_responder(Some(Box::new(|packet: &[u8]| {
        (packet[3] == 0x00).then(|| control_frame(&[field::COMPAND, 6], false))
    })));

    let err = h.api.compand(true, false).unwrap_err();
    match err {
        DriverError::ChipCommandFailed { command, status } => {
            assert_eq!(command, "COMPAND");
            assert_eq!(status, 6);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn mode_commands_check_the_echoed_field() {
    let h = harness(false);
    h.api.ecmode(0, ModeFlags::default()).unwrap();
    h.api
        .dcmode(
            2,
            ModeFlags {
                ns_e: true,
                ..ModeFlags::default()
            },
        )
        .unwrap();
}

#[test]
fn prodid_returns_the_chip_string() {
    let h = harness(false);
    assert_eq!(h.api.prodid().unwrap(), "AMBE3003");
}

#[test]
fn compress_and_decompress_round_trip() {
    let h = harness(false);

    let samples = [0x0102i16; 160];
    let response = h.api.compress(1, &samples).unwrap().wait().unwrap();
    let (bits, count) = response.bits().unwrap();
    assert_eq!(count, 88);
    assert_eq!(bits.len(), 11);

    let bits = bits.to_vec();
    let response = h.api.decompress(1, &bits, count).unwrap().wait().unwrap();
    let decoded = response.samples().unwrap();
    assert_eq!(decoded.len(), 160);
}

#[test]
fn responses_with_parity_are_verified() {
    let h = harness(true);
    h.api.compand(false, false).unwrap();

    // Corrupt the parity byte of every response; the API must refuse it.
    h.device.set_responder(Some(Box::new(|packet: &[u8]| {
        if packet[3] != 0x00 {
            return None;
        }
        let mut response = control_frame(&[field::COMPAND, 0], true);
        let last = response.len() - 1;
        response[last] ^= 0xff;
        Some(response)
    })));
    let err = h.api.compand(false, false).unwrap_err();
    assert!(matches!(err, DriverError::Proto(_)));
}
