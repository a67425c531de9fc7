//! Chunked transfer round trips and session bookkeeping

use base64::Engine as _;
use tokio::sync::mpsc;
use uuid::Uuid;

use forge_fleet::protocol::{Envelope, UploadStartData};
use forge_fleet::{CHUNK_SIZE, UploadSessions};

/// Apply sender output to a receiver table the way a connection would:
/// strictly in send order
async fn replay(
    sessions: &UploadSessions,
    connection_id: Uuid,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::UploadStart { data } => {
                sessions.start(connection_id, &data).await.unwrap();
            }
            Envelope::UploadChunk { data } => {
                sessions
                    .chunk(connection_id, &data.upload_id, &data.chunk_base64)
                    .await
                    .unwrap();
            }
            Envelope::UploadEnd { data } => {
                sessions.end(connection_id, &data.upload_id).await.unwrap();
            }
            other => panic!("sender emitted unexpected envelope: {other:?}"),
        }
    }
}

/// Round-trip one payload through sender and receiver, returning the landed
/// bytes
async fn round_trip(payload: &[u8]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    tokio::fs::write(&source, payload).await.unwrap();

    let save_root = tempfile::tempdir().unwrap();
    let sessions = UploadSessions::new(save_root.path());
    let connection_id = Uuid::new_v4();

    let (tx, rx) = mpsc::channel(8);
    let source_for_upload = source.clone();
    let uploader = tokio::spawn(async move {
        forge_fleet::transfer::upload_file(&tx, "u1", "landed.bin", None, &source_for_upload)
            .await
            .unwrap();
    });
    replay(&sessions, connection_id, rx).await;
    uploader.await.unwrap();

    assert_eq!(sessions.open_sessions().await, 0);
    tokio::fs::read(save_root.path().join("landed.bin"))
        .await
        .unwrap()
}

#[tokio::test]
async fn empty_file_round_trips() {
    assert_eq!(round_trip(b"").await, b"");
}

#[tokio::test]
async fn sub_chunk_file_round_trips() {
    let payload: Vec<u8> = (0..=255).collect();
    assert_eq!(round_trip(&payload).await, payload);
}

#[tokio::test]
async fn exact_chunk_boundary_round_trips() {
    let payload: Vec<u8> = (0..CHUNK_SIZE).map(|i| u8::try_from(i % 251).unwrap()).collect();
    assert_eq!(round_trip(&payload).await, payload);
}

#[tokio::test]
async fn multi_chunk_file_round_trips() {
    let payload: Vec<u8> = (0..2 * CHUNK_SIZE + 17)
        .map(|i| u8::try_from(i % 241).unwrap())
        .collect();
    assert_eq!(round_trip(&payload).await, payload);
}

#[tokio::test]
async fn concurrent_sessions_do_not_interleave() {
    let save_root = tempfile::tempdir().unwrap();
    let sessions = UploadSessions::new(save_root.path());
    let connection_id = Uuid::new_v4();

    let encode = |bytes: &[u8]| base64::engine::general_purpose::STANDARD.encode(bytes);

    for (upload_id, file_name) in [("u-a", "a.bin"), ("u-b", "b.bin")] {
        sessions
            .start(
                connection_id,
                &UploadStartData {
                    upload_id: upload_id.to_string(),
                    file_name: file_name.to_string(),
                    sub_dir: None,
                },
            )
            .await
            .unwrap();
    }

    // interleave chunks of the two sessions chunk-by-chunk
    for round in 0..4_u8 {
        sessions
            .chunk(connection_id, "u-a", &encode(&[round; 8]))
            .await
            .unwrap();
        sessions
            .chunk(connection_id, "u-b", &encode(&[round + 100; 8]))
            .await
            .unwrap();
    }
    sessions.end(connection_id, "u-a").await.unwrap();
    sessions.end(connection_id, "u-b").await.unwrap();

    let a = std::fs::read(save_root.path().join("a.bin")).unwrap();
    let b = std::fs::read(save_root.path().join("b.bin")).unwrap();
    let expected_a: Vec<u8> = (0..4_u8).flat_map(|r| [r; 8]).collect();
    let expected_b: Vec<u8> = (0..4_u8).flat_map(|r| [r + 100; 8]).collect();
    assert_eq!(a, expected_a);
    assert_eq!(b, expected_b);
}

#[tokio::test]
async fn disconnect_drops_sessions_and_rejects_late_chunks() {
    let save_root = tempfile::tempdir().unwrap();
    let sessions = UploadSessions::new(save_root.path());
    let connection_id = Uuid::new_v4();

    sessions
        .start(
            connection_id,
            &UploadStartData {
                upload_id: "u1".to_string(),
                file_name: "partial.bin".to_string(),
                sub_dir: None,
            },
        )
        .await
        .unwrap();
    sessions
        .chunk(
            connection_id,
            "u1",
            &base64::engine::general_purpose::STANDARD.encode(b"before"),
        )
        .await
        .unwrap();

    sessions.remove_for_connection(connection_id).await;
    assert_eq!(sessions.open_sessions().await, 0);

    // the dangling session must not accept further writes
    sessions
        .chunk(
            connection_id,
            "u1",
            &base64::engine::general_purpose::STANDARD.encode(b"after"),
        )
        .await
        .unwrap();
    assert!(sessions.end(connection_id, "u1").await.unwrap().is_none());

    let landed = std::fs::read(save_root.path().join("partial.bin")).unwrap();
    assert_eq!(landed, b"before");
}
