// ===============================
// src/recorder.rs
// ===============================
//
// Recorder JSONL untuk report risk:
// - Satu UserReport per baris (append), dari broadcast channel scheduler.
// - BufWriter + flush tiap 1s dan/atau tiap 100 report.
// - Parent directory dibuat otomatis.
// - Kalau tertinggal (lagged), catat jumlah report yang terlewat dan lanjut.
//
// ENV: set `RECORD_FILE=/path/to/reports.jsonl` agar aktif (lihat main.rs).
//
use std::path::Path;
use std::sync::Arc;

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::broadcast::{self, error::RecvError},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::report::UserReport;

const FLUSH_EVERY_N_REPORTS: u32 = 100;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: broadcast::Receiver<Arc<UserReport>>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let rpt = match msg {
                    Ok(r) => r,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "recorder: lagging behind, reports skipped");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                };
                let line = match serde_json::to_string(&*rpt) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, user = rpt.user_id, "recorder: serialize error, skip report");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(error = %e, "recorder: write failed, attempting reopen");
                    // coba lagi sekali setelah reopen
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(error = %e2, "recorder: write failed again after reopen, drop report");
                            }
                        }
                        Err(e2) => error!(error = %e2, "recorder: reopen failed, drop report"),
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_REPORTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                // Flush periodik
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Named;

    #[tokio::test]
    async fn writes_one_line_per_report() {
        let dir = std::env::temp_dir().join(format!("risk-rec-{}", std::process::id()));
        let path = dir.join("nested").join("reports.jsonl");
        let (tx, rx) = broadcast::channel(8);
        let task = tokio::spawn(run(rx, path.to_string_lossy().into_owned()));

        for user_id in [1, 2] {
            tx.send(Arc::new(UserReport { user_id, ts: 5, portfolios: Named::default() })).unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let body = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines, [r#"{"user_id":1,"ts":5,"portfolios":{}}"#, r#"{"user_id":2,"ts":5,"portfolios":{}}"#]);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
