use super::*;

use moka::notification::RemovalCause;
use tokio::sync::TryAcquireError;

use crate::config::CollectorConfig;
use crate::templates;

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &CollectorConfig,
        recorder: Option<SessionRecorder>,
    ) -> Self {
        let capacity = config.concurrency.max(1);
        let listener_recorder = recorder.clone();
        let idle: Cache<String, Arc<IdleSlot>> = Cache::builder()
            .max_capacity(capacity as u64)
            .time_to_idle(config.session_idle_timeout())
            .eviction_listener(move |key: Arc<String>, slot: Arc<IdleSlot>, cause| {
                // Explicit removals are acquire/evict/shutdown, which take the
                // session themselves.
                if cause == RemovalCause::Explicit {
                    return;
                }
                let Some(session) = slot.take() else {
                    return;
                };
                debug!("Idle session {} evicted ({:?})", key, cause);
                if let Some(recorder) = listener_recorder.as_ref() {
                    let _ = recorder.record_event(SessionEvent::SessionClosed {
                        device: session.device_id.clone(),
                        reason: format!("idle eviction: {cause:?}"),
                    });
                }
                match tokio::runtime::Handle::try_current() {
                    Ok(rt) => {
                        rt.spawn(session.close());
                    }
                    Err(_) => drop(session),
                }
            })
            .build();

        Self {
            connector,
            idle,
            permits: Arc::new(Semaphore::new(capacity)),
            released: Notify::new(),
            capacity,
            retry: config.retry.clone(),
            connect_timeout: config.connect_timeout(),
            preamble_timeout: config.standard_timeout(),
            failed: std::sync::Mutex::new(HashMap::new()),
            contact_gates: std::sync::Mutex::new(HashMap::new()),
            recorder,
        }
    }

    /// Returns a ready session for `device`.
    ///
    /// Reuses a healthy idle session when one is pooled, otherwise opens a new
    /// one (with the platform preamble) under the pool bound. Transport-class
    /// failures are retried per the [`RetryPolicy`]; a terminal failure is
    /// remembered and every later call for the device fails fast.
    pub async fn acquire(&self, device: &Device) -> Result<Session, ConnectError> {
        if let Some((kind, reason)) = self.failure_for(&device.id) {
            return Err(ConnectError::DeviceFailed {
                device: device.id.clone(),
                kind,
                reason,
            });
        }

        if let Some(session) = self.take_idle(&device.id).await {
            if session.is_healthy() {
                trace!(
                    "{} reusing pooled session (idle {:?}, {} commands run)",
                    device.id,
                    session.idle_for(),
                    session.commands_run()
                );
                return Ok(session);
            }
            self.close_session(session, "unhealthy in pool").await;
        }

        // Until a device has answered once, its opens are serialized so a
        // terminal failure is seen by exactly one attempt.
        let gate = self.contact_gate(&device.id);
        let mut first_contact = Some(gate.lock_owned().await);
        if first_contact.as_ref().is_some_and(|contacted| **contacted) {
            first_contact = None;
        } else if let Some((kind, reason)) = self.failure_for(&device.id) {
            return Err(ConnectError::DeviceFailed {
                device: device.id.clone(),
                kind,
                reason,
            });
        }

        let permit = self.reserve_slot().await?;
        match self.open(device).await {
            Ok((shell, retries)) => {
                if let Some(contacted) = first_contact.as_mut() {
                    **contacted = true;
                }
                let session = Session::new(device, shell, retries, permit);
                self.record(SessionEvent::SessionOpened {
                    device: device.id.clone(),
                    connect_retries: retries,
                });
                debug!("{} session opened after {} retries", device.id, retries);
                Ok(session)
            }
            Err(err) => {
                self.remember_failure(&device.id, &err);
                Err(err)
            }
        }
    }

    /// Returns a session to the pool, or closes it if it is unhealthy.
    pub async fn release(&self, session: Session) {
        if !session.is_healthy() {
            self.close_session(session, "unhealthy").await;
            return;
        }
        let key = session.device_id.clone();
        self.idle.insert(key, Arc::new(IdleSlot::new(session))).await;
        self.released.notify_waiters();
    }

    /// Runs one command on a session.
    ///
    /// Any error leaves the shell in an unknown state, so the session is
    /// marked unhealthy and will be closed on release.
    pub async fn execute(
        &self,
        session: &mut Session,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellOutput, ConnectError> {
        let result = session.shell.execute(command, timeout).await;
        session.last_used = Instant::now();
        session.commands_run += 1;
        if let Err(err) = &result {
            debug!("{} '{}' failed: {}", session.device_id, command, err);
            session.mark_unhealthy();
        }
        self.record_output(&session.device_id, command, &result);
        result
    }

    /// Closes every pooled session.
    pub async fn shutdown(&self) {
        self.idle.run_pending_tasks().await;
        let keys = self.idle.iter().map(|(k, _)| k).collect::<Vec<_>>();
        for key in keys {
            if let Some(session) = self.take_idle(key.as_str()).await {
                self.close_session(session, "shutdown").await;
            }
        }
        self.idle.invalidate_all();
    }

    /// Sessions currently open, pooled or in use.
    pub fn open_sessions(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Terminal failure recorded for a device this run, if any.
    pub fn failure_for(&self, device_id: &str) -> Option<(FailureKind, String)> {
        let guard = match self.failed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(device_id).cloned()
    }

    pub fn recorder(&self) -> Option<&SessionRecorder> {
        self.recorder.as_ref()
    }

    fn contact_gate(&self, device_id: &str) -> Arc<tokio::sync::Mutex<bool>> {
        let mut guard = match self.contact_gates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.entry(device_id.to_string()).or_default().clone()
    }

    async fn take_idle(&self, device_id: &str) -> Option<Session> {
        self.idle.remove(device_id).await.and_then(|slot| slot.take())
    }

    /// Waits for room under the pool bound, evicting idle sessions of other
    /// devices before blocking.
    async fn reserve_slot(&self) -> Result<OwnedSemaphorePermit, ConnectError> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => return Ok(permit),
                Err(TryAcquireError::Closed) => {
                    return Err(ConnectError::InternalServerError(
                        "session pool closed".to_string(),
                    ));
                }
                Err(TryAcquireError::NoPermits) => {}
            }

            if self.evict_one_idle().await {
                continue;
            }

            tokio::select! {
                permit = self.permits.clone().acquire_owned() => {
                    return permit.map_err(|_| {
                        ConnectError::InternalServerError("session pool closed".to_string())
                    });
                }
                _ = &mut notified => {}
            }
        }
    }

    async fn evict_one_idle(&self) -> bool {
        self.idle.run_pending_tasks().await;
        let Some((key, _)) = self.idle.iter().next() else {
            return false;
        };
        match self.take_idle(key.as_str()).await {
            Some(session) => {
                self.close_session(session, "evicted for capacity").await;
                true
            }
            None => false,
        }
    }

    /// Connects and runs the preamble as one retried unit.
    async fn open(&self, device: &Device) -> Result<(Box<dyn Shell>, u32), ConnectError> {
        retry_with_backoff(&self.retry, &device.id, |_| async {
            let mut shell = tokio::time::timeout(self.connect_timeout, self.connector.connect(device))
                .await
                .map_err(|_| {
                    ConnectError::Transport(format!(
                        "{}: connect timed out after {:?}",
                        device.id, self.connect_timeout
                    ))
                })??;
            if let Err(err) = self.run_preamble(device, shell.as_mut()).await {
                let _ = shell.close().await;
                return Err(err);
            }
            Ok(shell)
        })
        .await
    }

    async fn run_preamble(&self, device: &Device, shell: &mut dyn Shell) -> Result<(), ConnectError> {
        for command in templates::preamble(device.platform) {
            let result = shell.execute(command, self.preamble_timeout).await;
            self.record_output(&device.id, command, &result);
            let output = result?;
            if !output.success {
                warn!("{} preamble '{}' rejected: {}", device.id, command, output.content.trim());
            }
        }
        Ok(())
    }

    async fn close_session(&self, session: Session, reason: &str) {
        debug!(
            "{} closing session ({}): open {:?}, {} commands run",
            session.device_id,
            reason,
            session.age(),
            session.commands_run()
        );
        self.record(SessionEvent::SessionClosed {
            device: session.device_id.clone(),
            reason: reason.to_string(),
        });
        session.close().await;
    }

    fn remember_failure(&self, device_id: &str, err: &ConnectError) {
        let terminal = match err {
            ConnectError::Auth(_) | ConnectError::HostKeyRejected(_) => true,
            // Retries are spent by the time these surface.
            err if err.is_retryable() => true,
            _ => false,
        };
        if !terminal {
            return;
        }
        let mut guard = match self.failed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .entry(device_id.to_string())
            .or_insert_with(|| (err.failure_kind(), err.to_string()));
    }

    fn record(&self, event: SessionEvent) {
        if let Some(recorder) = self.recorder.as_ref()
            && let Err(e) = recorder.record_event(event)
        {
            debug!("session record failed: {}", e);
        }
    }

    fn record_output(
        &self,
        device_id: &str,
        command: &str,
        result: &Result<ShellOutput, ConnectError>,
    ) {
        if self.recorder.is_none() {
            return;
        }
        let event = match result {
            Ok(output) => SessionEvent::CommandOutput {
                device: device_id.to_string(),
                command: command.to_string(),
                success: output.success,
                content: output.content.clone(),
                failure: None,
                error: None,
            },
            Err(err) => SessionEvent::CommandOutput {
                device: device_id.to_string(),
                command: command.to_string(),
                success: false,
                content: match err {
                    ConnectError::ExecTimeout(partial) => partial.clone(),
                    _ => String::new(),
                },
                failure: Some(err.failure_kind()),
                error: Some(err.to_string()),
            },
        };
        self.record(event);
    }
}
