//! The writer task.
//!
//! Runs on a blocking thread and is the only owner of the active
//! [`FileSession`]. Commands are handled in queue order, up to `max_batch`
//! per wakeup. Appends become visible to producers only after they are
//! committed (synced per [`FsyncPolicy`]); a failed sync rolls the file back
//! to the last commit.

use crate::config::{EngineConfig, FsyncPolicy};
use crate::engine::{AppendReply, AppendResult, Command, EngineState, Shared};
use crate::error::EngineError;
use framelog_store::{
    verify_file, FileNaming, FileScanner, FileSession, FrameCodec, LogRecord, RotationPolicy,
    RotationReason, SessionMark, StoreError, Timestamp,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Appends written since the last commit.
struct Uncommitted {
    mark: SessionMark,
    last_sequence: Option<u64>,
    appended: Vec<(AppendReply, AppendResult)>,
}

pub(crate) struct Writer {
    dir: PathBuf,
    naming: FileNaming,
    rotation: RotationPolicy,
    max_files: usize,
    fsync_policy: FsyncPolicy,
    max_batch: usize,
    file_mode: Option<u32>,
    codec: FrameCodec,
    /// None while degraded.
    session: Option<FileSession>,
    next_index: u64,
    /// Highest sequence appended, committed or not.
    last_sequence: Option<u64>,
    uncommitted: Option<Uncommitted>,
    /// Results waiting to be sent to producers.
    settled: Vec<(AppendReply, Result<AppendResult, EngineError>)>,
    shared: Arc<Shared>,
}

impl Writer {
    /// Opens the active file: the latest one unless it is corrupt or already
    /// due for rotation, or a new one for an empty stream.
    pub(crate) fn open(config: &EngineConfig, shared: Arc<Shared>) -> Result<Self, EngineError> {
        let codec = FrameCodec::new(config.digest.clone(), config.text.clone());
        let indices = FileScanner::list(&config.dir, &config.naming)?;
        let create = |index: u64| {
            FileSession::create_with_mode(
                &config.dir,
                &config.naming,
                index,
                &codec,
                config.rotation.clone(),
                config.file_mode,
            )
        };

        let session = match indices.last() {
            Some(&index) => match FileSession::resume(
                &config.dir,
                &config.naming,
                index,
                &codec,
                config.rotation.clone(),
            ) {
                Ok(mut session) => match session.should_rotate(Timestamp::now()) {
                    Some(reason) => {
                        tracing::info!(
                            "{} is due for rotation ({}), starting a new file",
                            session.path().display(),
                            reason
                        );
                        session.close();
                        create(index + 1)?
                    }
                    None => session,
                },
                Err(e) if e.is_corruption() => {
                    tracing::warn!(
                        "{} is corrupt, leaving it untouched and starting a new file: {}",
                        config.naming.path(&config.dir, index).display(),
                        e
                    );
                    create(index + 1)?
                }
                Err(e) => return Err(e.into()),
            },
            None => create(1)?,
        };

        let mut last_sequence = session.last_sequence();
        if last_sequence.is_none() {
            let earlier: Vec<u64> = indices
                .iter()
                .copied()
                .filter(|&index| index != session.index())
                .collect();
            last_sequence = last_sequence_in(&config.dir, &config.naming, &codec, &earlier)?;
        }

        tracing::info!(
            "Opened {} (index {}, {} records, last sequence {:?})",
            session.path().display(),
            session.index(),
            session.record_count(),
            last_sequence
        );
        *shared.last_sequence.lock() = last_sequence;

        let writer = Self {
            dir: config.dir.clone(),
            naming: config.naming.clone(),
            rotation: config.rotation.clone(),
            max_files: config.max_files,
            fsync_policy: config.fsync_policy,
            max_batch: config.max_batch,
            file_mode: config.file_mode,
            codec,
            next_index: session.index() + 1,
            session: Some(session),
            last_sequence,
            uncommitted: None,
            settled: Vec::new(),
            shared,
        };
        writer.enforce_retention();

        Ok(writer)
    }

    /// Processes commands until shutdown or until every sender is gone.
    pub(crate) fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut batch = Vec::with_capacity(self.max_batch);

        while let Some(command) = rx.blocking_recv() {
            batch.push(command);
            while batch.len() < self.max_batch {
                match rx.try_recv() {
                    Ok(command) => batch.push(command),
                    Err(_) => break,
                }
            }

            tracing::debug!("Processing batch of {} commands", batch.len());
            if let Some(reply) = self.process(&mut batch) {
                self.finish(&mut rx);
                let _ = reply.send(());
                return;
            }
        }

        self.close();
    }

    /// Handles one batch. Returns the shutdown reply if the batch contained one.
    fn process(&mut self, batch: &mut Vec<Command>) -> Option<oneshot::Sender<()>> {
        self.set_active(EngineState::Writing);
        let mut shutdown = None;

        for command in batch.drain(..) {
            if shutdown.is_some() {
                reject(command);
                continue;
            }
            match command {
                Command::Append { record, reply } => self.handle_append(record, reply),
                Command::Flush { reply } => {
                    let result = self.flush();
                    let _ = reply.send(result);
                }
                Command::Shutdown { reply } => shutdown = Some(reply),
            }
        }

        self.commit();
        self.resolve();
        self.set_active(EngineState::Idle);
        shutdown
    }

    fn handle_append(&mut self, record: LogRecord, reply: AppendReply) {
        if reply.is_closed() {
            self.shared.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sequence = record.sequence(), "Skipping cancelled record");
            return;
        }

        match self.append(&record) {
            Ok(result) => {
                match self.uncommitted.as_mut() {
                    Some(pending) => pending.appended.push((reply, result)),
                    None => self.settled.push((reply, Ok(result))),
                }
                if self.fsync_policy == FsyncPolicy::EveryWrite {
                    self.commit();
                }
                if let Some(reason) = self.due_rotation() {
                    self.commit();
                    self.rotate(reason);
                }
            }
            Err(e) => {
                self.shared.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(sequence = record.sequence(), "Append failed: {}", e);
                self.settled.push((reply, Err(e)));
            }
        }

        self.resolve();
    }

    fn append(&mut self, record: &LogRecord) -> Result<AppendResult, EngineError> {
        if let Some(last) = self.last_sequence {
            if record.sequence() <= last {
                return Err(EngineError::SequenceRegression {
                    last,
                    got: record.sequence(),
                });
            }
        }

        // Only age can expire a file between appends.
        if let Some(reason) = self.due_rotation() {
            self.commit();
            self.rotate(reason);
        }
        self.ensure_session()?;

        let Some(session) = self.session.as_mut() else {
            return Err(EngineError::IoWrite("no active log file".to_string()));
        };

        let frame = self
            .codec
            .encode(record, session.last_digest())
            .map_err(EngineError::from_append)?;

        if self.uncommitted.is_none() {
            self.uncommitted = Some(Uncommitted {
                mark: session.mark(),
                last_sequence: self.last_sequence,
                appended: Vec::new(),
            });
        }

        let outcome = session.append(&frame).map_err(EngineError::from_append)?;
        self.last_sequence = Some(record.sequence());

        Ok(AppendResult {
            sequence: record.sequence(),
            file_index: session.index(),
            path: session.path().to_path_buf(),
            offset: outcome.offset,
            len: outcome.len,
            link: outcome.link,
        })
    }

    /// Syncs uncommitted appends and settles their producers.
    fn commit(&mut self) {
        let Some(pending) = self.uncommitted.take() else {
            return;
        };
        if pending.appended.is_empty() {
            return;
        }

        let Some(session) = self.session.as_mut() else {
            let count = pending.appended.len() as u64;
            self.shared.failed.fetch_add(count, Ordering::Relaxed);
            self.last_sequence = pending.last_sequence;
            self.settled.extend(pending.appended.into_iter().map(|(reply, _)| {
                (reply, Err(EngineError::IoWrite("log file closed before sync".to_string())))
            }));
            return;
        };

        let synced = match self.fsync_policy {
            FsyncPolicy::Never => Ok(false),
            FsyncPolicy::EveryWrite | FsyncPolicy::EveryBatch => {
                let needed = session.needs_sync();
                session.sync().map(|()| needed)
            }
        };

        match synced {
            Ok(did_sync) => {
                if did_sync {
                    self.shared.fsyncs.fetch_add(1, Ordering::Relaxed);
                }
                let count = pending.appended.len() as u64;
                let bytes: u64 = pending.appended.iter().map(|(_, r)| r.len).sum();
                self.shared.records_appended.fetch_add(count, Ordering::Relaxed);
                self.shared.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                *self.shared.last_sequence.lock() = self.last_sequence;
                self.settled.extend(
                    pending
                        .appended
                        .into_iter()
                        .map(|(reply, result)| (reply, Ok(result))),
                );
            }
            Err(e) => {
                let count = pending.appended.len() as u64;
                tracing::error!(
                    "Sync of {} failed, discarding {} records: {}",
                    session.path().display(),
                    count,
                    e
                );
                session.rollback(pending.mark);
                self.last_sequence = pending.last_sequence;
                self.shared.failed.fetch_add(count, Ordering::Relaxed);

                let message = e.to_string();
                self.settled.extend(pending.appended.into_iter().map(|(reply, _)| {
                    (reply, Err(EngineError::IoWrite(message.clone())))
                }));
            }
        }
    }

    fn resolve(&mut self) {
        for (reply, result) in self.settled.drain(..) {
            reply.send(result);
        }
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.commit();
        self.resolve();

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.needs_sync() {
            session
                .sync()
                .map_err(|e| EngineError::IoWrite(e.to_string()))?;
            self.shared.fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn due_rotation(&self) -> Option<RotationReason> {
        self.session
            .as_ref()
            .and_then(|session| session.should_rotate(Timestamp::now()))
    }

    /// Closes the active file and opens the next one. Must follow a commit.
    fn rotate(&mut self, reason: RotationReason) {
        self.shared.set_state(EngineState::RotationPending);

        if let Some(mut old) = self.session.take() {
            tracing::info!(
                "Rotating {} after {} records, {} bytes ({})",
                old.path().display(),
                old.record_count(),
                old.offset(),
                reason
            );
            old.close();
            self.shared.rotations.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = self.open_next() {
            tracing::error!(
                "Rotation failed, appends will fail until {} can be created: {}",
                self.naming.path(&self.dir, self.next_index).display(),
                e
            );
        }
    }

    /// Retries opening the next file while degraded.
    fn ensure_session(&mut self) -> Result<(), EngineError> {
        if self.session.is_some() {
            return Ok(());
        }
        self.open_next()
            .map_err(|e| EngineError::IoWrite(format!("no active log file: {}", e)))
    }

    fn open_next(&mut self) -> Result<(), StoreError> {
        match FileSession::create_with_mode(
            &self.dir,
            &self.naming,
            self.next_index,
            &self.codec,
            self.rotation.clone(),
            self.file_mode,
        ) {
            Ok(session) => {
                tracing::info!("Opened {}", session.path().display());
                self.next_index += 1;
                self.session = Some(session);
                self.shared.set_state(EngineState::Writing);
                self.enforce_retention();
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(EngineState::Degraded);
                Err(e)
            }
        }
    }

    fn enforce_retention(&self) {
        if self.max_files == 0 {
            return;
        }
        let Some(active) = self.session.as_ref().map(|s| s.index()) else {
            return;
        };

        match FileScanner::prune(&self.dir, &self.naming, self.max_files, active) {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!("Removed {} old log files: {:?}", removed.len(), removed);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to apply retention: {}", e),
        }
    }

    fn set_active(&self, state: EngineState) {
        if self.session.is_some() {
            self.shared.set_state(state);
        }
    }

    /// Commits, closes the active file and marks the engine closed.
    fn close(&mut self) {
        self.commit();
        self.resolve();
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.set_state(EngineState::Closed);
    }

    /// Closes and fails everything still queued.
    fn finish(&mut self, rx: &mut mpsc::Receiver<Command>) {
        self.close();
        rx.close();

        let mut rejected = 0usize;
        while let Some(command) = rx.blocking_recv() {
            reject(command);
            rejected += 1;
        }
        tracing::info!("Writer engine closed ({} queued commands rejected)", rejected);
    }
}

fn reject(command: Command) {
    match command {
        Command::Append { reply, .. } => {
            reply.send(Err(EngineError::EngineClosed));
        }
        Command::Flush { reply } => {
            let _ = reply.send(Err(EngineError::EngineClosed));
        }
        // Dropping the reply wakes the caller.
        Command::Shutdown { .. } => {}
    }
}

/// Last sequence of the newest non-empty file among `indices`.
fn last_sequence_in(
    dir: &Path,
    naming: &FileNaming,
    codec: &FrameCodec,
    indices: &[u64],
) -> Result<Option<u64>, StoreError> {
    for &index in indices.iter().rev() {
        let report = verify_file(naming.path(dir, index), codec)?;
        if report.last_sequence.is_some() {
            return Ok(report.last_sequence);
        }
    }
    Ok(None)
}
