//! Wire-level integrity exchanges: the exact peak and uncle sequences a
//! serving peer owes for a requested chunk, and that they fold to the
//! swarm id.

use std::time::Duration;

use riptide_core::bin::ChunkRange;
use riptide_core::codec::Message;
use riptide_core::merkle::{leaf_hash, node_hash, Hash, EMPTY_HASH};

use crate::*;

/// Hash of a subtree derivable from the proof set: an exact entry, zero
/// padding where no entry overlaps, or the combination of both halves.
fn proof_hash(range: ChunkRange, proof: &[(ChunkRange, Hash)]) -> Hash {
    if let Some((_, h)) = proof.iter().find(|(r, _)| *r == range) {
        return *h;
    }
    if !proof.iter().any(|(r, _)| r.overlaps(&range)) {
        return EMPTY_HASH;
    }
    let mid = range.start + (range.count() / 2) as u32;
    node_hash(
        &proof_hash(ChunkRange::new(range.start, mid - 1), proof),
        &proof_hash(ChunkRange::new(mid, range.end), proof),
    )
}

/// Fold a leaf and its proof set up to the root: combine the running
/// subtree with the adjacent sibling until everything proven is covered.
fn fold_to_root(chunk: u32, payload: &[u8], proof: &[(ChunkRange, Hash)]) -> Hash {
    let max_end = proof
        .iter()
        .map(|(r, _)| r.end)
        .max()
        .unwrap_or(chunk)
        .max(chunk);
    let mut range = ChunkRange::single(chunk);
    let mut hash = leaf_hash(payload);
    while !(range.start == 0 && range.end >= max_end) {
        let width = range.count() as u32;
        if (range.start / width) % 2 == 0 {
            let sibling = ChunkRange::new(range.start + width, range.end + width);
            hash = node_hash(&hash, &proof_hash(sibling, proof));
            range = ChunkRange::new(range.start, sibling.end);
        } else {
            let sibling = ChunkRange::new(range.start - width, range.start - 1);
            hash = node_hash(&proof_hash(sibling, proof), &hash);
            range = ChunkRange::new(sibling.start, range.end);
        }
    }
    hash
}

#[tokio::test]
async fn single_peak_request_yields_uncle_chain() {
    let dir = tempfile::tempdir().unwrap();
    // 64 KiB exactly: 64 chunks, one peak covering (0,63).
    let source = write_content(dir.path(), "claire.ts", 64 * 1024);
    let seeder = engine(dir.path()).await.unwrap();
    let root = seeder.attach_file(source.clone()).await.unwrap();

    let probe = WireProbe::connect(seeder.udp_addr, root).await.unwrap();
    probe
        .send(&[Message::Request(ChunkRange::single(0))])
        .await
        .unwrap();

    let msgs = probe.collect_until_data(Duration::from_secs(5)).await.unwrap();
    let integrity: Vec<(ChunkRange, Hash)> = msgs
        .iter()
        .filter_map(|m| match m {
            Message::Integrity { range, hash } => {
                Some((*range, <Hash>::try_from(hash.as_slice()).unwrap()))
            }
            _ => None,
        })
        .collect();

    // The uncle chain for chunk 0, bottom-up. No peak records: the single
    // peak IS the root.
    let expected: Vec<ChunkRange> = [
        (1, 1),
        (2, 3),
        (4, 7),
        (8, 15),
        (16, 31),
        (32, 63),
    ]
    .iter()
    .map(|&(s, e)| ChunkRange::new(s, e))
    .collect();
    assert_eq!(
        integrity.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
        expected
    );

    let (data_range, payload) = msgs
        .iter()
        .find_map(|m| match m {
            Message::Data { range, payload, timestamp } => {
                assert!(*timestamp > 0, "DATA must carry a timestamp");
                Some((*range, payload.clone()))
            }
            _ => None,
        })
        .expect("DATA for chunk 0");
    assert_eq!(data_range, ChunkRange::single(0));
    assert_eq!(&payload[..], &content(64 * 1024)[..1024]);

    // Leaf + uncles must reproduce the swarm id.
    assert_eq!(fold_to_root(0, &payload, &integrity), root);
    seeder.shutdown();
}

#[tokio::test]
async fn mid_range_request_sends_peaks_then_uncles() {
    let dir = tempfile::tempdir().unwrap();
    // 195.788 KiB: 196 chunks, peaks (0,127) (128,191) (192,195).
    let size = 195 * 1024 + 807;
    let source = write_content(dir.path(), "bill.ts", size);
    let seeder = engine(dir.path()).await.unwrap();
    let root = seeder.attach_file(source.clone()).await.unwrap();

    let probe = WireProbe::connect(seeder.udp_addr, root).await.unwrap();
    probe
        .send(&[Message::Request(ChunkRange::single(67))])
        .await
        .unwrap();

    let msgs = probe.collect_until_data(Duration::from_secs(5)).await.unwrap();
    let ranges: Vec<ChunkRange> = msgs
        .iter()
        .filter_map(|m| match m {
            Message::Integrity { range, .. } => Some(*range),
            _ => None,
        })
        .collect();

    // Peaks smallest-covering-subtree first, then uncles bottom-up.
    let expected: Vec<ChunkRange> = [
        (192, 195),
        (128, 191),
        (0, 127),
        (66, 66),
        (64, 65),
        (68, 71),
        (72, 79),
        (80, 95),
        (96, 127),
        (0, 63),
    ]
    .iter()
    .map(|&(s, e)| ChunkRange::new(s, e))
    .collect();
    assert_eq!(ranges, expected);

    let payload = msgs
        .iter()
        .find_map(|m| match m {
            Message::Data { range, payload, .. } if *range == ChunkRange::single(67) => {
                Some(payload.clone())
            }
            _ => None,
        })
        .expect("DATA for chunk 67");
    assert_eq!(&payload[..], &content(size)[67 * 1024..68 * 1024]);

    // Peaks + uncles + leaf fold to the swarm id.
    let proof: Vec<(ChunkRange, Hash)> = msgs
        .iter()
        .filter_map(|m| match m {
            Message::Integrity { range, hash } => {
                Some((*range, <Hash>::try_from(hash.as_slice()).unwrap()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(fold_to_root(67, &payload, &proof), root);
    seeder.shutdown();
}

#[tokio::test]
async fn second_request_skips_known_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_content(dir.path(), "two.ts", 4 * 1024);
    let seeder = engine(dir.path()).await.unwrap();
    let root = seeder.attach_file(source.clone()).await.unwrap();

    let probe = WireProbe::connect(seeder.udp_addr, root).await.unwrap();
    probe
        .send(&[Message::Request(ChunkRange::single(0))])
        .await
        .unwrap();
    let first = probe.collect_until_data(Duration::from_secs(5)).await.unwrap();
    let first_count = first
        .iter()
        .filter(|m| matches!(m, Message::Integrity { .. }))
        .count();
    assert_eq!(first_count, 2); // (1,1) and (2,3)

    probe
        .send(&[Message::Request(ChunkRange::single(1))])
        .await
        .unwrap();
    let second = probe.collect_until_data(Duration::from_secs(5)).await.unwrap();
    let second_count = second
        .iter()
        .filter(|m| matches!(m, Message::Integrity { .. }))
        .count();
    // (0,0)'s sibling chain is already out; chunk 1 needs nothing new.
    assert_eq!(second_count, 0);
    seeder.shutdown();
}
