//! Sender side of the chunked upload protocol

use std::path::Path;

use base64::Engine as _;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::protocol::{
    CHUNK_SIZE, Envelope, UploadChunkData, UploadEndData, UploadStartData,
};
use crate::{Error, Result};

/// Stream a file as `upload-start` / `upload-chunk`* / `upload-end`
///
/// Chunks are read sequentially and queued strictly in file order; the
/// receiver reassembles by arrival order, so the outbound queue must feed an
/// ordered transport. Callers needing delivery confirmation correlate on the
/// final `upload-ack`.
///
/// # Errors
///
/// Returns an error if the source cannot be read or the outbound queue is
/// closed. A transfer that fails mid-stream must be restarted from the
/// beginning with a fresh upload id.
pub async fn upload_file(
    outbound: &mpsc::Sender<Envelope>,
    upload_id: &str,
    file_name: &str,
    sub_dir: Option<String>,
    source: &Path,
) -> Result<()> {
    let start = Envelope::UploadStart {
        data: UploadStartData {
            upload_id: upload_id.to_string(),
            file_name: file_name.to_string(),
            sub_dir,
        },
    };
    send(outbound, start).await?;

    let mut file = File::open(source).await?;
    let mut buf = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        let chunk = Envelope::UploadChunk {
            data: UploadChunkData {
                upload_id: upload_id.to_string(),
                chunk_base64: base64::engine::general_purpose::STANDARD.encode(&buf[..read]),
            },
        };
        send(outbound, chunk).await?;
    }

    send(
        outbound,
        Envelope::UploadEnd {
            data: UploadEndData {
                upload_id: upload_id.to_string(),
            },
        },
    )
    .await
}

async fn send(outbound: &mpsc::Sender<Envelope>, envelope: Envelope) -> Result<()> {
    outbound
        .send(envelope)
        .await
        .map_err(|_| Error::Network("connection closed during upload".to_string()))
}
