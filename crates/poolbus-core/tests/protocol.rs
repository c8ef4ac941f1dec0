use poolbus_core::protocol::{
    encode, parse_packet_str, CommandBuilder, Frame, FrameAssembler, FrameFamily, ProtocolError,
};
use pretty_assertions::assert_eq;

const PUMP_REMOTE: [u8; 7] = [165, 0, 96, 16, 6, 1, 10];
const CHLOR_SET: [u8; 5] = [16, 2, 80, 20, 0];

#[test]
fn test_chlorinator_encoding() {
    let bytes = encode(&CHLOR_SET).unwrap();
    assert_eq!(bytes, vec![16, 2, 80, 20, 0, 118, 16, 3]);

    let frame = Frame::from_bytes(&bytes).unwrap();
    assert_eq!(frame.family(), FrameFamily::Chlorinator);
    assert_eq!(frame.dest(), 80);
    assert_eq!(frame.action(), 20);
    assert_eq!(frame.source(), None);
}

#[test]
fn test_pump_encoding() {
    let bytes = encode(&PUMP_REMOTE).unwrap();
    assert_eq!(
        bytes,
        vec![255, 0, 255, 165, 0, 96, 16, 6, 1, 10, 1, 38]
    );

    let frame = Frame::from_bytes(&bytes).unwrap();
    assert_eq!(frame.family(), FrameFamily::Pump);
    assert_eq!(frame.checksum(), 294);
    assert_eq!(frame.payload(), PUMP_REMOTE.to_vec());
}

#[test]
fn test_builder_matches_literal_payload() {
    let payload = CommandBuilder::pump(96, 16, 6).byte(10).build().unwrap();
    assert_eq!(payload, PUMP_REMOTE.to_vec());

    let parsed = parse_packet_str("96-16-6-1-10", 33).unwrap();
    assert_eq!(parsed, PUMP_REMOTE.to_vec());
}

#[test]
fn test_resync_after_noise() {
    let mut stream = vec![7, 255, 0, 4, 12];
    stream.extend(encode(&CHLOR_SET).unwrap());
    stream.extend(encode(&PUMP_REMOTE).unwrap());

    let mut asm = FrameAssembler::default();
    asm.feed(&stream);
    let frames: Vec<Frame> = asm.frames().map(Result::unwrap).collect();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].family(), FrameFamily::Chlorinator);
    assert_eq!(frames[1].family(), FrameFamily::Pump);
    assert_eq!(asm.buffered_len(), 0);
}

#[test]
fn test_byte_at_a_time() {
    let bytes = encode(&PUMP_REMOTE).unwrap();
    let mut asm = FrameAssembler::new(1);
    let mut frames = Vec::new();
    for b in &bytes {
        asm.feed(&[*b]);
        frames.extend(asm.frames());
    }
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_ref().unwrap().to_bytes(), bytes);
}

#[test]
fn test_flipped_byte_rejected() {
    let mut bytes = encode(&PUMP_REMOTE).unwrap();
    bytes[9] ^= 0x01;

    let mut asm = FrameAssembler::default();
    asm.feed(&bytes);
    let results: Vec<_> = asm.frames().collect();
    assert_eq!(results.len(), 1);

    let rejected = results[0].as_ref().unwrap_err();
    assert_eq!(rejected.bytes, bytes);
    assert_eq!(
        rejected.error,
        ProtocolError::ChecksumMismatch {
            expected: 295,
            actual: 294
        }
    );
}

#[test]
fn test_frame_after_rejected_frame() {
    let mut bad = encode(&PUMP_REMOTE).unwrap();
    bad[9] = 11;
    let good = encode(&[165, 33, 15, 16, 2, 3, 12, 30, 0]).unwrap();

    let mut asm = FrameAssembler::default();
    asm.feed(&bad);
    asm.feed(&good);
    let results: Vec<_> = asm.frames().collect();

    assert_eq!(results.len(), 2);
    assert!(results[0].is_err());
    let frame = results[1].as_ref().unwrap();
    assert_eq!(frame.family(), FrameFamily::Controller);
    assert_eq!(frame.sub(), Some(33));
}

/// Small deterministic generator so failures reproduce
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn byte(&mut self) -> u8 {
        (self.next() >> 24) as u8
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn random_payload(rng: &mut XorShift) -> Vec<u8> {
    if rng.below(3) == 0 {
        let mut payload = vec![16, 2, rng.byte(), rng.byte()];
        let len = rng.below(12) as usize;
        // a data byte of 16 could read as the start of the trailer
        payload.extend((0..len).map(|_| match rng.byte() {
            16 => 17,
            b => b,
        }));
        payload
    } else {
        let len = rng.below(40) as usize;
        let mut payload = vec![165, rng.byte(), rng.byte(), rng.byte(), rng.byte(), len as u8];
        payload.extend((0..len).map(|_| rng.byte()));
        payload
    }
}

#[test]
fn test_random_payloads_round_trip_and_detect_flips() {
    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
    for _ in 0..2000 {
        let payload = random_payload(&mut rng);
        let bytes = encode(&payload).unwrap_or_else(|e| panic!("{:?} rejected: {}", payload, e));

        let frame = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(frame.payload(), payload);
        assert!(frame.is_valid());

        // preamble and marker bytes select the family; everything after is covered
        let first_checked = if payload[0] == 165 { 4 } else { 2 };
        for at in first_checked..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[at] ^= (rng.below(255) + 1) as u8;
            let accepted = matches!(Frame::from_bytes(&corrupted), Ok(f) if f.is_valid());
            assert!(!accepted, "flip at {} of {:?} went unnoticed", at, bytes);
        }
    }
}
