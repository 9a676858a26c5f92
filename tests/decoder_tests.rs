use svcprobe_rs::chunked::{ChunkState, ChunkedDecoder, DecodeStatus};
use svcprobe_rs::verify::{compute_digest, verify, Content, ContentRule, DigestAlgorithm};

const BODIES: &[&[u8]] = &[
    b"0\r\n\r\n",
    b"5\r\nhello\r\n0\r\n\r\n",
    b"4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n",
    b"a;name=value\r\n0123456789\r\n1A\r\nabcdefghijklmnopqrstuvwxyz\r\n0\r\nX-Trailer: yes\r\n\r\n",
    b"3\nabc\n0\n\n",
];

fn decode_whole(body: &[u8]) -> Vec<u8> {
    let mut d = ChunkedDecoder::new();
    assert_eq!(d.feed(body).unwrap(), DecodeStatus::Done);
    d.into_output()
}

#[test]
fn byte_at_a_time_matches_single_feed() {
    for body in BODIES {
        let expected = decode_whole(body);
        let mut d = ChunkedDecoder::new();
        let mut status = DecodeStatus::NeedMore;
        for b in body.iter() {
            status = d.feed(std::slice::from_ref(b)).unwrap();
        }
        assert_eq!(status, DecodeStatus::Done);
        assert_eq!(d.output(), expected.as_slice(), "body {:?}", String::from_utf8_lossy(body));
    }
}

#[test]
fn every_two_way_split_matches_single_feed() {
    for body in BODIES {
        let expected = decode_whole(body);
        for cut in 0..=body.len() {
            let mut d = ChunkedDecoder::new();
            d.feed(&body[..cut]).unwrap();
            let second = d.feed(&body[cut..]).unwrap();
            assert_eq!(second, DecodeStatus::Done);
            assert_eq!(d.output(), expected.as_slice(), "cut at {cut}");
        }
    }
}

#[test]
fn decoded_output_is_the_payload() {
    assert_eq!(decode_whole(BODIES[2]), b"Wikipedia in\r\n\r\nchunks.");
    assert_eq!(decode_whole(BODIES[3]).len(), 10 + 26);
}

#[test]
fn malformed_input_is_sticky() {
    let mut d = ChunkedDecoder::new();
    assert!(d.feed(b"5\r\nhel").is_ok());
    assert!(d.feed(b"loX").is_err());
    assert_eq!(d.state(), ChunkState::Malformed);
    assert!(d.feed(b"\r\n0\r\n\r\n").is_err());
}

#[test]
fn premature_end_is_malformed() {
    let mut d = ChunkedDecoder::new();
    d.feed(b"8\r\nabc").unwrap();
    assert!(d.finish().is_err());
    assert_eq!(d.state(), ChunkState::Malformed);
}

#[test]
fn digest_of_identical_content_passes_and_any_mutation_fails() {
    let samples: &[&[u8]] = &[b"x", b"<html><body>OK</body></html>", &[0u8, 1, 2, 254, 255]];
    let algorithms = [
        DigestAlgorithm::Md5,
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Ripemd160,
        DigestAlgorithm::Sha224,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];
    for algo in algorithms {
        for sample in samples {
            let rule = ContentRule::digest(&compute_digest(algo, sample)).unwrap();
            assert!(verify(&Content::new(sample), &rule).passed());

            for i in 0..sample.len() {
                let mut mutated = sample.to_vec();
                mutated[i] ^= 0x01;
                assert!(!verify(&Content::new(&mutated), &rule).passed(), "{algo} byte {i}");
            }
        }
    }
}

#[test]
fn digest_rule_accepts_hash_prefix_and_upper_case() {
    let digest = compute_digest(DigestAlgorithm::Sha256, b"abc").to_uppercase().replacen("SHA256", "sha256", 1);
    let rule = ContentRule::digest(&format!("#{digest}")).unwrap();
    assert!(verify(&Content::new(b"abc"), &rule).passed());
    assert!(ContentRule::digest("md5:abcd").is_ok());
    assert!(ContentRule::digest("md4:abcd").is_err());
    assert!(ContentRule::digest("sha256:not-hex").is_err());
}
