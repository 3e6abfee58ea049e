//! Integration tests for the BT64 engine.
//!
//! These exercise the public API end to end: creation, pushes across
//! page splits, chunked values, range fetches, iteration, reopen
//! round-trips, and random workloads interleaved with the integrity
//! checker.

use std::io;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use isam::isam::bt64::{Bt64, KeyRange};
use isam::isam::fbt64::FBt64;

#[test]
fn test_single_key_single_value() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("single.ibt");

    let mut bt = Bt64::create(&path).unwrap();
    bt.push(0x0102030405060708, b"hello").unwrap();

    let mut out = Vec::new();
    assert_eq!(bt.fetch(0x0102030405060708, &mut out).unwrap(), 5);
    assert_eq!(&out, b"hello");
}

#[test]
fn test_multi_value_same_key_concatenates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("multi.ibt");

    let mut bt = Bt64::create(&path).unwrap();
    bt.push(42, b"a").unwrap();
    bt.push(42, b"bb").unwrap();
    bt.push(42, b"ccc").unwrap();

    let mut out = Vec::new();
    assert_eq!(bt.fetch(42, &mut out).unwrap(), 6);
    assert_eq!(&out, b"abbccc");

    let items: Vec<_> = bt.iter().collect();
    assert_eq!(items, vec![(42u64, b"abbccc".to_vec())]);
}

#[test]
fn test_large_value_chunks_reconstruct() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chunks.ibt");

    let value: Vec<u8> = (0u32..1024).map(|i| (i % 256) as u8).collect();
    let mut bt = Bt64::create(&path).unwrap();
    bt.push(1, &value).unwrap();
    bt.check_integrity(false, &mut io::sink()).unwrap();

    let mut out = Vec::new();
    assert_eq!(bt.fetch(1, &mut out).unwrap(), 1024);
    assert_eq!(out, value);

    // chunked values survive a reopen too
    bt.close().unwrap();
    let bt = Bt64::open(&path, false, true).unwrap();
    let mut out = Vec::new();
    assert_eq!(bt.fetch(1, &mut out).unwrap(), 1024);
    assert_eq!(out, value);
}

#[test]
fn test_round_trip_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.ibt");

    let n = 10_000u64;
    {
        let mut bt = Bt64::create(&path).unwrap();
        for i in 0..n {
            bt.push(i, &(i as u32).to_le_bytes()).unwrap();
        }
        bt.close().unwrap();
    }

    let bt = Bt64::open(&path, false, true).unwrap();
    for i in (0..n).step_by(997) {
        let mut out = Vec::new();
        assert_eq!(bt.fetch(i, &mut out).unwrap(), 4);
        assert_eq!(out, (i as u32).to_le_bytes());
    }
}

#[test]
fn test_iterator_ascends_across_leaves() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("iter.ibt");

    let mut bt = Bt64::create(&path).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut expect = std::collections::BTreeSet::new();
    for _ in 0..4000 {
        let key = rng.gen_range(0..50_000u64);
        bt.push(key, b"v").unwrap();
        expect.insert(key);
    }

    let keys: Vec<u64> = bt.iter().map(|(k, _)| k).collect();
    let sorted: Vec<u64> = expect.into_iter().collect();
    assert_eq!(keys, sorted);
}

#[test]
fn test_fetch_range_collects_per_key_spans() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("range.ibt");

    let mut bt = Bt64::create(&path).unwrap();
    for i in 0..1000u64 {
        bt.push(i * 2, &(i as u16).to_le_bytes()).unwrap();
    }

    let mut out = KeyRange::default();
    bt.fetch_range(100, 110, &mut out).unwrap();
    let keys: Vec<u64> = out.keys.iter().map(|r| r.key).collect();
    assert_eq!(keys, vec![100, 102, 104, 106, 108, 110]);
    for (i, rec) in out.keys.iter().enumerate() {
        assert_eq!(out.data_of(i), ((rec.key / 2) as u16).to_le_bytes());
    }

    // full-range scan with kmax at the integer ceiling
    let mut all = KeyRange::default();
    bt.fetch_range(0, u64::MAX, &mut all).unwrap();
    assert_eq!(all.keys.len(), 1000);
}

#[test]
fn test_random_pushes_interleaved_with_check() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fuzz.ibt");

    let mut bt = Bt64::create(&path).unwrap();
    let mut rng = StdRng::seed_from_u64(0xb7_64);
    let mut model: std::collections::HashMap<u64, Vec<u8>> = std::collections::HashMap::new();

    // Each key sees exactly three pushes of at most 40 bytes, so every
    // key stays within one record and fetch preserves push order.
    for round in 0..6000u64 {
        let key = (round * 997) % 2_000;
        let len = rng.gen_range(1..=40usize);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        bt.push(key, &data).unwrap();
        model.entry(key).or_default().extend_from_slice(&data);

        if round % 1000 == 999 {
            bt.check_integrity(false, &mut io::sink()).unwrap();
        }
    }
    bt.check_integrity(false, &mut io::sink()).unwrap();

    // appended values come back as one sequence per key
    for (key, expect) in model.iter().take(300) {
        let mut out = Vec::new();
        let len = bt.fetch(*key, &mut out).unwrap();
        assert_eq!(len, expect.len(), "length mismatch for key {}", key);
        assert_eq!(&out, expect, "data mismatch for key {}", key);
    }
}

#[test]
fn test_insertion_order_independence_per_key() {
    let dir = tempdir().unwrap();
    let pa = dir.path().join("a.ibt");
    let pb = dir.path().join("b.ibt");

    // Same per-key value sequences, interleaved differently across keys.
    let mut a = Bt64::create(&pa).unwrap();
    for i in 0..500u64 {
        a.push(i % 50, &[(i / 50) as u8]).unwrap();
    }
    let mut b = Bt64::create(&pb).unwrap();
    for key in 0..50u64 {
        for v in 0..10u8 {
            b.push(key, &[v]).unwrap();
        }
    }

    for key in 0..50u64 {
        let mut va = Vec::new();
        let mut vb = Vec::new();
        a.fetch(key, &mut va).unwrap();
        b.fetch(key, &mut vb).unwrap();
        assert_eq!(va, vb, "key {}", key);
    }
}

#[test]
fn test_file_backed_variant_agrees_after_heavy_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("big.ibt");

    {
        let mut bt = Bt64::create(&path).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..20_000 {
            let key = rng.gen_range(0..10_000u64);
            bt.push(key, &key.to_le_bytes()).unwrap();
        }
        bt.close().unwrap();
    }

    let bt = Bt64::open(&path, false, true).unwrap();
    let fbt = FBt64::open(&path).unwrap();
    for key in (0..10_000u64).step_by(397) {
        let mut a = Vec::new();
        let mut b = Vec::new();
        assert_eq!(bt.fetch(key, &mut a).unwrap(), fbt.fetch(key, &mut b).unwrap());
        assert_eq!(a, b);
    }
}
