//! CANCEL semantics: a cancel arriving behind a request suppresses the
//! not-yet-sent chunks.

use std::time::Duration;

use riptide_core::bin::ChunkRange;
use riptide_core::codec::Message;

use crate::*;

#[tokio::test]
async fn cancel_suppresses_queued_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let size = 195 * 1024 + 807; // 196 chunks
    let source = write_content(dir.path(), "bill.ts", size);
    let seeder = engine(dir.path()).await.unwrap();
    let root = seeder.attach_file(source).await.unwrap();

    let probe = WireProbe::connect(seeder.udp_addr, root).await.unwrap();
    probe
        .send(&[Message::Request(ChunkRange::new(67, 68))])
        .await
        .unwrap();
    probe
        .send(&[Message::Cancel(ChunkRange::single(68))])
        .await
        .unwrap();

    // Collect DATA for two seconds; 67 must arrive, 68 must not.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut got = Vec::new();
    loop {
        let Some(left) = deadline.checked_duration_since(tokio::time::Instant::now()) else {
            break;
        };
        match probe.recv_msgs(left).await {
            Ok(msgs) => {
                for msg in msgs {
                    if let Message::Data { range, .. } = msg {
                        got.push(range.start);
                    }
                }
            }
            Err(_) => break,
        }
    }
    assert!(got.contains(&67), "expected DATA for chunk 67, got {got:?}");
    assert!(
        !got.contains(&68),
        "cancelled chunk 68 must not be delivered, got {got:?}"
    );
    seeder.shutdown();
}
