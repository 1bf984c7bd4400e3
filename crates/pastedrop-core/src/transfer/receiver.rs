//! 接收端
//!
//! 按到达顺序追加消息，累计字节数首次达到声明大小时完成，且只完成一次。
//! 完成后的文件交给 `Persistence` 保存。

use anyhow::Context;
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::signaling::FileManifest;
use crate::status::ProgressSink;

/// 接收状态，只追加
#[derive(Debug, Default)]
pub struct TransferState {
    received: Vec<Vec<u8>>,
    received_count: u64,
    total_expected: u64,
}

impl TransferState {
    pub fn new(total_expected: u64) -> Self {
        Self {
            received: Vec::new(),
            received_count: 0,
            total_expected,
        }
    }

    pub fn append(&mut self, message: Vec<u8>) {
        self.received_count += message.len() as u64;
        self.received.push(message);
    }

    pub fn is_complete(&self) -> bool {
        self.received_count >= self.total_expected
    }

    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    pub fn total_expected(&self) -> u64 {
        self.total_expected
    }

    /// 进度，封顶 1.0
    pub fn fraction(&self) -> f64 {
        if self.total_expected == 0 {
            return 1.0;
        }
        (self.received_count as f64 / self.total_expected as f64).min(1.0)
    }

    /// 按接收顺序拼接全部分块
    fn concat(&mut self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.received_count as usize);
        for chunk in self.received.drain(..) {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }
}

/// 接收完成的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub bytes: Vec<u8>,
    pub name: String,
    pub mime_type: String,
}

/// 分块重组器
#[derive(Debug)]
pub struct Reassembler {
    manifest: FileManifest,
    state: TransferState,
    finalized: bool,
}

impl Reassembler {
    pub fn new(manifest: FileManifest) -> Self {
        let state = TransferState::new(manifest.size);
        Self {
            manifest,
            state,
            finalized: false,
        }
    }

    pub fn manifest(&self) -> &FileManifest {
        &self.manifest
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// 处理一条消息；使累计字节数首次达到声明大小的那条消息返回完成的文件
    pub fn push(&mut self, message: Vec<u8>, progress: &dyn ProgressSink) -> Option<ReceivedFile> {
        if self.finalized {
            debug!("Ignoring {} bytes received after completion", message.len());
            return None;
        }

        self.state.append(message);
        progress.on_progress(self.state.fraction());
        self.take_if_complete()
    }

    /// 已满足完成条件且尚未完成过时返回文件；空文件无需等待任何消息
    pub fn take_if_complete(&mut self) -> Option<ReceivedFile> {
        if self.finalized || !self.state.is_complete() {
            return None;
        }
        self.finalized = true;

        info!(
            "Received {} of {} bytes for '{}'",
            self.state.received_count(),
            self.state.total_expected(),
            self.manifest.name
        );

        Some(ReceivedFile {
            bytes: self.state.concat(),
            name: self.manifest.name.clone(),
            mime_type: self.manifest.effective_mime_type().to_string(),
        })
    }
}

/// 持久化接口，每次完成的传输调用一次
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    async fn save(&self, payload: &[u8], name: &str, mime_type: &str) -> anyhow::Result<PathBuf>;
}

/// 保存到目录
pub struct DirectoryPersistence {
    dir: PathBuf,
}

impl DirectoryPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// 去掉路径部分和不安全字符，名字来自对端，不可信
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        "received.bin".to_string()
    } else {
        cleaned
    }
}

/// 目标已存在时追加 ` (N)`
async fn available_path(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };

    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, counter, ext));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

#[async_trait::async_trait]
impl Persistence for DirectoryPersistence {
    async fn save(&self, payload: &[u8], name: &str, mime_type: &str) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = available_path(&self.dir, &sanitize_file_name(name)).await?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(
            "Saved {} bytes ({}) to {}",
            payload.len(),
            mime_type,
            path.display()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::NullSink;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProgress(Mutex<Vec<f64>>);

    impl ProgressSink for RecordingProgress {
        fn on_progress(&self, fraction: f64) {
            self.0.lock().unwrap().push(fraction);
        }
    }

    #[test]
    fn test_completes_on_third_message_only() {
        let mut reassembler =
            Reassembler::new(FileManifest::new("a.bin", 40_000, "application/x-test"));
        let progress = RecordingProgress::default();

        assert!(reassembler.push(vec![1; 16_384], &progress).is_none());
        assert_eq!(reassembler.state().received_count(), 16_384);
        assert!(reassembler.push(vec![2; 16_384], &progress).is_none());
        assert_eq!(reassembler.state().received_count(), 32_768);

        let file = reassembler.push(vec![3; 7_232], &progress).unwrap();
        assert_eq!(file.bytes.len(), 40_000);
        assert_eq!(file.bytes[0], 1);
        assert_eq!(file.bytes[16_384], 2);
        assert_eq!(file.bytes[39_999], 3);
        assert_eq!(file.name, "a.bin");
        assert_eq!(file.mime_type, "application/x-test");

        let fractions = progress.0.into_inner().unwrap();
        assert_eq!(fractions.len(), 3);
        assert!((fractions[2] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_messages_after_completion_are_ignored() {
        let mut reassembler = Reassembler::new(FileManifest::new("a.bin", 4, ""));

        // 超出剩余长度的消息同样触发完成
        let file = reassembler.push(vec![9; 10], &NullSink).unwrap();
        assert_eq!(file.bytes.len(), 10);
        assert_eq!(file.mime_type, "application/octet-stream");

        assert!(reassembler.push(vec![1; 4], &NullSink).is_none());
        assert!(reassembler.take_if_complete().is_none());
        assert!(reassembler.is_finalized());
    }

    #[test]
    fn test_empty_file_completes_without_messages() {
        let mut reassembler = Reassembler::new(FileManifest::new("empty.txt", 0, "text/plain"));
        let file = reassembler.take_if_complete().unwrap();
        assert!(file.bytes.is_empty());
        assert!(reassembler.take_if_complete().is_none());
    }

    #[test]
    fn test_progress_is_capped() {
        let mut state = TransferState::new(10);
        state.append(vec![0; 25]);
        assert!((state.fraction() - 1.0).abs() < f64::EPSILON);
        assert!(state.is_complete());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\tmp\\a?.txt"), "a_.txt");
        assert_eq!(sanitize_file_name("..."), "received.bin");
        assert_eq!(sanitize_file_name(""), "received.bin");
        assert_eq!(sanitize_file_name("报告 final.pdf"), "报告 final.pdf");
    }

    #[tokio::test]
    async fn test_directory_persistence_avoids_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = DirectoryPersistence::new(dir.path().join("downloads"));

        let first = persistence.save(b"one", "note.txt", "text/plain").await.unwrap();
        let second = persistence.save(b"two", "note.txt", "text/plain").await.unwrap();
        let third = persistence.save(b"three", "note.txt", "text/plain").await.unwrap();

        assert_eq!(first.file_name().unwrap(), "note.txt");
        assert_eq!(second.file_name().unwrap(), "note (1).txt");
        assert_eq!(third.file_name().unwrap(), "note (2).txt");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }
}
