use crate::error::{HubError, HubResult};
use crate::session::{Session, Subscriber};
use aoc_remote_core::protocol::{MessageQuery, MessagesPayload, ProjectInfo, ProjectStats};
use aoc_remote_core::{new_project_id, ProjectMetadata, ProjectState, TimestampedMessage};
use aoc_remote_storage::{MessageLog, ProjectStore, RotationPolicy};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    path::{Component, Path},
    sync::{Arc, Mutex as StdMutex},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const MAX_PATH_BYTES: usize = 4096;

struct ProjectInner {
    metadata: ProjectMetadata,
    last_error: Option<String>,
    subscribers: HashMap<String, Subscriber>,
    /// Set by delete under the lock. No metadata is written afterwards.
    deleted: bool,
}

impl ProjectInner {
    fn info(&self) -> ProjectInfo {
        ProjectInfo {
            id: self.metadata.id.clone(),
            path: self.metadata.path.clone(),
            state: self.metadata.state,
            claude_session_id: self.metadata.claude_session_id.clone(),
            created_at: self.metadata.created_at,
            last_active: self.metadata.last_active,
            last_error: self.last_error.clone(),
            subscribers: self.subscribers.len(),
        }
    }
}

/// A registered project. State and subscribers only change under `inner`.
pub struct Project {
    id: String,
    inner: Mutex<ProjectInner>,
    log: Arc<StdMutex<Option<MessageLog>>>,
}

impl Project {
    fn new(metadata: ProjectMetadata, log: MessageLog) -> Self {
        Self {
            id: metadata.id.clone(),
            inner: Mutex::new(ProjectInner {
                metadata,
                last_error: None,
                subscribers: HashMap::new(),
                deleted: false,
            }),
            log: Arc::new(StdMutex::new(Some(log))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn info(&self) -> ProjectInfo {
        self.inner.lock().await.info()
    }

    /// Point-in-time copy of the subscriber set.
    pub async fn subscribers(&self) -> Vec<Subscriber> {
        self.inner.lock().await.subscribers.values().cloned().collect()
    }

    async fn add_subscriber(&self, subscriber: Subscriber) -> ProjectInfo {
        let mut inner = self.inner.lock().await;
        inner
            .subscribers
            .insert(subscriber.session_id.clone(), subscriber);
        inner.info()
    }

    async fn remove_subscriber(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .subscribers
            .remove(session_id)
            .is_some()
    }

    /// Appends to the project's message log off the async runtime.
    pub async fn append(&self, message: TimestampedMessage) -> HubResult<()> {
        let log = self.log.clone();
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.as_mut() {
                Some(log) => log.append(&message).map_err(HubError::from),
                None => Err(HubError::project_not_found(&id)),
            }
        })
        .await?
    }

    pub async fn messages_since(&self, since: DateTime<Utc>) -> HubResult<Vec<TimestampedMessage>> {
        let log = self.log.clone();
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            let guard = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.as_ref() {
                Some(log) => log.messages_since(since).map_err(HubError::from),
                None => Err(HubError::project_not_found(&id)),
            }
        })
        .await?
    }

    /// Seals the open segment. Later appends fail with not-found.
    async fn close_log(&self) -> HubResult<()> {
        let log = self.log.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.take() {
                Some(mut log) => log.close().map_err(HubError::from),
                None => Ok(()),
            }
        })
        .await?
    }
}

pub struct ProjectRegistry {
    store: ProjectStore,
    rotation: RotationPolicy,
    max_projects: usize,
    projects: RwLock<HashMap<String, Arc<Project>>>,
    create_lock: Mutex<()>,
}

impl ProjectRegistry {
    pub fn new(store: ProjectStore, rotation: RotationPolicy, max_projects: usize) -> Self {
        Self {
            store,
            rotation,
            max_projects,
            projects: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// Rebuilds the registry from disk. Every loaded project starts idle.
    pub async fn load(
        store: ProjectStore,
        rotation: RotationPolicy,
        max_projects: usize,
    ) -> HubResult<Self> {
        let registry = Self::new(store, rotation, max_projects);
        let loader = registry.store.clone();
        let report = tokio::task::spawn_blocking(move || loader.load_all()).await??;
        for (id, err) in &report.failed {
            warn!(event = "project_omitted", project_id = %id, error = %err);
        }

        let mut projects = registry.projects.write().await;
        for mut metadata in report.projects {
            if metadata.state != ProjectState::Idle {
                debug!(event = "project_state_reset", project_id = %metadata.id, state = %metadata.state);
                metadata.state = ProjectState::Idle;
            }
            let log = registry.open_log(&metadata.id)?;
            projects.insert(metadata.id.clone(), Arc::new(Project::new(metadata, log)));
        }
        info!(
            event = "projects_loaded",
            count = projects.len(),
            recovered = report.recovered.len(),
            failed = report.failed.len()
        );
        drop(projects);
        Ok(registry)
    }

    fn open_log(&self, id: &str) -> HubResult<MessageLog> {
        Ok(MessageLog::new(self.store.logs_dir(id)?, self.rotation))
    }

    async fn persist(&self, metadata: ProjectMetadata) -> HubResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store.backup(&metadata.id)?;
            store.save(&metadata)
        })
        .await??;
        Ok(())
    }

    pub async fn create(&self, path: &str) -> HubResult<ProjectInfo> {
        let path = validate_path(path)?;
        let _guard = self.create_lock.lock().await;
        if self.projects.read().await.len() >= self.max_projects {
            return Err(HubError::project_limit(self.max_projects));
        }
        let metadata = ProjectMetadata::new(new_project_id(), path);
        let log = self.open_log(&metadata.id)?;
        self.persist(metadata.clone()).await?;

        let project = Arc::new(Project::new(metadata, log));
        let info = project.info().await;
        self.projects
            .write()
            .await
            .insert(project.id().to_string(), project);
        info!(event = "project_created", project_id = %info.id, path = %info.path);
        Ok(info)
    }

    /// Removes the project and its files. Returns the removed project, if it was
    /// registered, so callers can notify its last subscribers.
    pub async fn delete(&self, id: &str) -> HubResult<Option<Arc<Project>>> {
        let removed = self.projects.write().await.remove(id);
        if removed.is_none() && self.store.project_dir(id).is_err() {
            return Ok(None);
        }
        // Held until the files are gone so an in-flight mutation cannot rewrite them.
        let mut tombstone = None;
        if let Some(project) = &removed {
            let mut inner = project.inner.lock().await;
            inner.deleted = true;
            tombstone = Some(inner);
            if let Err(err) = project.close_log().await {
                warn!(event = "log_close_failed", project_id = %id, error = %err);
            }
        }
        let store = self.store.clone();
        let target = id.to_string();
        tokio::task::spawn_blocking(move || store.delete(&target)).await??;
        drop(tombstone);
        if removed.is_some() {
            info!(event = "project_deleted", project_id = %id);
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Project>> {
        self.projects.read().await.get(id).cloned()
    }

    async fn require(&self, id: &str) -> HubResult<Arc<Project>> {
        self.get(id)
            .await
            .ok_or_else(|| HubError::project_not_found(id))
    }

    pub async fn get_by_id(&self, id: &str) -> Option<ProjectInfo> {
        match self.get(id).await {
            Some(project) => Some(project.info().await),
            None => None,
        }
    }

    pub async fn list_all(&self) -> Vec<ProjectInfo> {
        let projects: Vec<Arc<Project>> = self.projects.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(projects.len());
        for project in projects {
            infos.push(project.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    pub async fn len(&self) -> usize {
        self.projects.read().await.len()
    }

    pub async fn stats(&self) -> Vec<ProjectStats> {
        self.list_all()
            .await
            .into_iter()
            .map(|info| ProjectStats {
                project_id: info.id,
                state: info.state,
                subscribers: info.subscribers,
            })
            .collect()
    }

    /// Subscribes the session. A session watches one project at a time, so a
    /// previous subscription is dropped first.
    pub async fn join(&self, id: &str, session: &Session) -> HubResult<ProjectInfo> {
        let project = self.require(id).await?;
        if let Some(previous) = session.joined_project() {
            if previous != id {
                self.leave_session(session).await;
            }
        }
        let info = project.add_subscriber(session.subscriber()).await;
        session.set_joined(Some(id.to_string()));
        debug!(event = "project_joined", project_id = %id, session_id = %session.id());
        Ok(info)
    }

    pub async fn leave(&self, id: &str, session: &Session) -> HubResult<bool> {
        let project = self.require(id).await?;
        let removed = project.remove_subscriber(session.id()).await;
        session.clear_joined_if(id);
        debug!(event = "project_left", project_id = %id, session_id = %session.id(), removed);
        Ok(removed)
    }

    /// Disconnect cleanup. Safe to call repeatedly and after the project is gone.
    pub async fn leave_session(&self, session: &Session) -> bool {
        let Some(project_id) = session.joined_project() else {
            return false;
        };
        if !session.clear_joined_if(&project_id) {
            return false;
        }
        match self.get(&project_id).await {
            Some(project) => project.remove_subscriber(session.id()).await,
            None => false,
        }
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> HubResult<ProjectInfo>
    where
        F: FnOnce(&mut ProjectMetadata, &mut Option<String>) -> HubResult<()>,
    {
        let project = self.require(id).await?;
        let mut inner = project.inner.lock().await;
        if inner.deleted {
            return Err(HubError::project_not_found(id));
        }
        let mut metadata = inner.metadata.clone();
        let mut last_error = inner.last_error.clone();
        apply(&mut metadata, &mut last_error)?;
        metadata.last_active = Utc::now();
        self.persist(metadata.clone()).await?;
        inner.metadata = metadata;
        inner.last_error = last_error;
        Ok(inner.info())
    }

    pub async fn update_state(
        &self,
        id: &str,
        state: ProjectState,
        last_error: Option<String>,
    ) -> HubResult<ProjectInfo> {
        let info = self
            .mutate(id, |metadata, error| {
                metadata.state = state;
                *error = last_error;
                Ok(())
            })
            .await?;
        debug!(event = "project_state_changed", project_id = %id, state = %info.state);
        Ok(info)
    }

    /// Moves an idle or failed project to executing. Rejects a second execution.
    pub async fn begin_execution(&self, id: &str) -> HubResult<ProjectInfo> {
        self.mutate(id, |metadata, error| {
            if metadata.state.is_executing() {
                return Err(HubError::already_executing(id));
            }
            metadata.state = ProjectState::Executing;
            *error = None;
            Ok(())
        })
        .await
    }

    pub async fn update_session(
        &self,
        id: &str,
        claude_session_id: Option<String>,
    ) -> HubResult<ProjectInfo> {
        self.mutate(id, |metadata, _| {
            metadata.claude_session_id = claude_session_id;
            Ok(())
        })
        .await
    }

    /// Drops the external session handle. Not allowed while executing.
    pub async fn reset_session(&self, id: &str) -> HubResult<ProjectInfo> {
        self.mutate(id, |metadata, error| {
            if metadata.state.is_executing() {
                return Err(HubError::process_active(id));
            }
            metadata.claude_session_id = None;
            metadata.state = ProjectState::Idle;
            *error = None;
            Ok(())
        })
        .await
    }

    pub async fn append_message(&self, id: &str, message: TimestampedMessage) -> HubResult<()> {
        self.require(id).await?.append(message).await
    }

    pub async fn messages(&self, query: &MessageQuery) -> HubResult<MessagesPayload> {
        let project = self.require(&query.project_id).await?;
        let since = query.since.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut messages = project.messages_since(since).await?;
        if let Some(direction) = query.direction {
            messages.retain(|message| message.direction == direction);
        }
        let total = messages.len();
        let offset = query.effective_offset().min(total);
        let page: Vec<TimestampedMessage> = messages
            .into_iter()
            .skip(offset)
            .take(query.effective_limit())
            .collect();
        let has_more = offset + page.len() < total;
        Ok(MessagesPayload {
            project_id: query.project_id.clone(),
            messages: page,
            total,
            has_more,
        })
    }

    /// Seals every open log segment. Used on shutdown.
    pub async fn close_all(&self) {
        let projects: Vec<Arc<Project>> = self.projects.read().await.values().cloned().collect();
        for project in projects {
            if let Err(err) = project.close_log().await {
                warn!(event = "log_close_failed", project_id = %project.id(), error = %err);
            }
        }
    }
}

pub fn validate_path(raw: &str) -> HubResult<String> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(HubError::invalid_path("path is required"));
    }
    if path.len() > MAX_PATH_BYTES {
        return Err(HubError::invalid_path(format!(
            "path exceeds {MAX_PATH_BYTES} bytes"
        )));
    }
    if path.contains('\0') {
        return Err(HubError::invalid_path("path contains a NUL byte"));
    }
    let parsed = Path::new(path);
    if !parsed.is_absolute() {
        return Err(HubError::invalid_path("path must be absolute"));
    }
    if parsed
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(HubError::invalid_path("path must not contain '..'"));
    }
    Ok(path.to_string())
}
