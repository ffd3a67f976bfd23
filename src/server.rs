//! Newline-delimited JSON over TCP. One request per line, one response per line.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::rpc::{self, Response};
use crate::service::ApiService;

/// Accepts connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, svc: Arc<ApiService>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("listening on {addr}");
    }
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("connection from {peer}");
                        let svc = svc.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, svc).await {
                                log::warn!("connection {peer} closed with error: {e}");
                            }
                        });
                    }
                    Err(e) => log::error!("accept failed: {e}"),
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, svc: Arc<ApiService>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    // Requests run concurrently, so responses go through a single writer.
    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let mut line = match serde_json::to_vec(&resp) {
                Ok(v) => v,
                Err(e) => {
                    log::error!("failed to encode response: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            write_half.write_all(&line).await?;
        }
        write_half.shutdown().await
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match rpc::parse_request(&line) {
            Ok(req) => {
                let svc = svc.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let resp = rpc::dispatch(&svc, req).await;
                    let _ = tx.send(resp);
                });
            }
            Err(resp) => {
                let _ = tx.send(resp);
            }
        }
    }
    drop(tx);

    match writer.await {
        Ok(res) => res,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::Backends;
    use serde_json::Value;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn answers_each_line_and_echoes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            data_dir: dir.path().to_path_buf(),
            proton_dir: Some(dir.path().join("protons")),
            legendary_bin: dir.path().join("no-legendary"),
            ..Config::default()
        };
        let svc = Arc::new(ApiService::new(&cfg, Backends::production(&cfg)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, svc, async {
            let _ = stop_rx.await;
        }));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(b"{\"id\": 1, \"op\": \"get_status\"}\nnonsense\n")
            .await
            .unwrap();
        w.shutdown().await.unwrap();

        let mut lines = BufReader::new(r).lines();
        let mut got = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            got.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        assert_eq!(got.len(), 2);

        let status = got.iter().find(|v| v["id"] == 1).unwrap();
        assert_eq!(status["ok"], false);
        assert_eq!(status["error"]["kind"], "auth");

        let junk = got.iter().find(|v| v["id"].is_null()).unwrap();
        assert_eq!(junk["error"]["kind"], "validation");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
