//! tower-lsp glue driving the stores from an editor session.
//!
//! Each document notification follows the same shape: update the
//! [`DocumentStore`](crate::document::DocumentStore), ask the
//! [`Indexer`](crate::indexer::Indexer) for the jobs that re-derive the
//! directory, and wait for them so later requests see a consistent module.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use itertools::Itertools;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc::{Error, Result};
use tower_lsp::lsp_types::{
    DidChangeTextDocumentParams, DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, InitializeParams, InitializeResult, InitializedParams, MessageType,
    OneOf, ServerCapabilities, ServerInfo, TextDocumentSyncCapability, TextDocumentSyncKind,
    WorkspaceFoldersServerCapabilities, WorkspaceServerCapabilities,
};
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::document::apply_changes;
use crate::handle::{DirHandle, DocumentHandle};
use crate::indexer::{Analyzer, NoopAnalyzer};
use crate::job::{JobError, JobId};
use crate::state::StateStore;

pub struct Backend {
    client: Client,
    analyzer: Arc<dyn Analyzer>,
    state: RwLock<Option<Arc<StateStore>>>,
    roots: RwLock<Vec<DirHandle>>,
    /// Parent of every handler's wait token; cancelled on shutdown.
    session: CancellationToken,
}

impl Backend {
    pub fn new(client: Client) -> Backend {
        Backend::with_analyzer(client, Arc::new(NoopAnalyzer))
    }

    pub fn with_analyzer(client: Client, analyzer: Arc<dyn Analyzer>) -> Backend {
        Backend {
            client,
            analyzer,
            state: RwLock::new(None),
            roots: RwLock::new(vec![]),
            session: CancellationToken::new(),
        }
    }

    /// The session state, once `initialize` has run.
    pub fn state(&self) -> Option<Arc<StateStore>> {
        self.state.read().clone()
    }

    pub fn roots(&self) -> Vec<DirHandle> {
        self.roots.read().clone()
    }

    fn require_state(&self) -> anyhow::Result<Arc<StateStore>> {
        self.state().ok_or(anyhow!("server is not initialized"))
    }

    async fn wait(&self, state: &StateStore, ids: &[JobId]) -> anyhow::Result<()> {
        match state.wait_for_jobs(&self.session.child_token(), ids).await {
            Ok(()) => Ok(()),
            Err(JobError::WaitTimeout(timeout)) => Err(anyhow!("index not yet ready after {timeout:?}")),
            Err(err) => Err(err.into()),
        }
    }

    async fn report(&self, action: &str, result: anyhow::Result<()>) {
        if let Err(err) = result {
            warn!(action, error = %format!("{err:#}"), "handler failed");
            self.client
                .log_message(MessageType::ERROR, format!("{action}: {err:#}"))
                .await;
        }
    }

    fn start_walk(&self, state: &Arc<StateStore>, roots: Vec<DirHandle>) {
        if roots.is_empty() {
            return;
        }

        let walk = state
            .walker
            .spawn_walk(roots, state.settings().ignore_directory_names.clone());
        let client = self.client.clone();
        tokio::spawn(async move {
            let Ok(summaries) = walk.await else {
                warn!("workspace walk panicked");
                return;
            };
            let files = summaries.iter().map(|summary| summary.files).sum::<usize>();
            let errors = summaries.iter().map(|summary| summary.errors).sum::<usize>();
            client
                .log_message(
                    MessageType::INFO,
                    format!("indexed {files} files in {} roots ({errors} errors)", summaries.len()),
                )
                .await;
        });
    }

    async fn on_open(&self, params: DidOpenTextDocumentParams) -> anyhow::Result<()> {
        let state = self.require_state()?;
        let document = params.text_document;
        let handle = DocumentHandle::from_uri(&document.uri)?;

        state.documents.open_document(
            handle.clone(),
            document.language_id,
            document.text.as_str(),
            document.version,
        );

        let ids = state
            .indexer
            .document_opened(&self.session, handle.dir())?;
        self.wait(&state, &ids).await
    }

    async fn on_change(&self, params: DidChangeTextDocumentParams) -> anyhow::Result<()> {
        let state = self.require_state()?;
        let handle = DocumentHandle::from_uri(&params.text_document.uri)?;
        let document = state.documents.get_document(&handle)?;

        let version = params.text_document.version;
        // Versions don't have to be consecutive, but they must be increasing
        if version <= document.version {
            warn!(
                document = %handle,
                received = version,
                current = document.version,
                "ignoring old document version, this is likely a client bug"
            );
            return Ok(());
        }

        let text = apply_changes(&document.text, &params.content_changes)?;
        state.documents.update_document(&handle, text, version)?;

        let ids = state
            .indexer
            .document_changed(&self.session, handle.dir())?;
        self.wait(&state, &ids).await
    }

    async fn on_close(&self, params: DidCloseTextDocumentParams) -> anyhow::Result<()> {
        let state = self.require_state()?;
        let handle = DocumentHandle::from_uri(&params.text_document.uri)?;

        state.documents.close_document(&handle);
        state.indexer.document_closed(handle.dir())?;
        Ok(())
    }

    fn on_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) -> anyhow::Result<()> {
        let state = self.require_state()?;

        let removed = params
            .event
            .removed
            .iter()
            .map(|folder| DirHandle::from_uri(&folder.uri))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let added = params
            .event
            .added
            .iter()
            .map(|folder| DirHandle::from_uri(&folder.uri))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        {
            let mut roots = self.roots.write();
            roots.retain(|root| !removed.contains(root));
            for dir in &added {
                if !roots.contains(dir) {
                    roots.push(dir.clone());
                }
            }
        }
        for dir in &removed {
            let dropped = state.indexer.modules().remove_within(dir);
            debug!(root = %dir, modules = dropped, "removed workspace folder");
        }

        self.start_walk(&state, added);
        Ok(())
    }
}

/// Resolves the workspace roots named by `initialize`, folders first.
fn workspace_roots(params: &InitializeParams) -> anyhow::Result<Vec<DirHandle>> {
    if let Some(folders) = params.workspace_folders.as_ref().filter(|folders| !folders.is_empty()) {
        return folders
            .iter()
            .map(|folder| {
                DirHandle::from_uri(&folder.uri)
                    .with_context(|| format!("invalid workspace folder {}", folder.uri))
            })
            .collect();
    }

    #[allow(deprecated)]
    let root_uri = params.root_uri.as_ref();
    match root_uri {
        Some(uri) => Ok(vec![DirHandle::from_uri(uri)
            .with_context(|| format!("invalid root URI {uri}"))?]),
        None => Ok(vec![]),
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        if self.state.read().is_some() {
            return Err(Error::invalid_request());
        }

        let roots = workspace_roots(&params).map_err(|err| Error::invalid_params(format!("{err:#}")))?;
        let settings = Settings::new(
            roots.first().map(|root| root.path()),
            params.initialization_options.as_ref(),
        )
        .map_err(|err| Error::invalid_params(format!("{err:#}")))?;

        let state = StateStore::with_analyzer(&settings, self.analyzer.clone())
            .map_err(|err| Error {
                message: err.to_string().into(),
                ..Error::internal_error()
            })?;

        info!(roots = %roots.iter().join(", "), workers = settings.workers, "initialized session");
        *self.roots.write() = roots;
        *self.state.write() = Some(Arc::new(state));

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::INCREMENTAL,
                )),
                workspace: Some(WorkspaceServerCapabilities {
                    workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                        supported: Some(true),
                        change_notifications: Some(OneOf::Left(true)),
                    }),
                    file_operations: None,
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "retab-ls".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        if let Some(state) = self.state() {
            self.start_walk(&state, self.roots());
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.session.cancel();
        if let Some(state) = self.state() {
            state.shutdown();
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let result = self.on_open(params).await;
        self.report("didOpen", result).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let result = self.on_change(params).await;
        self.report("didChange", result).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let result = self.on_close(params).await;
        self.report("didClose", result).await;
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        let result = self.on_workspace_folders(params);
        self.report("didChangeWorkspaceFolders", result).await;
    }
}

/// Serves the protocol over stdio until the client exits.
pub async fn serve() {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::new(Backend::new);
    Server::new(stdin, stdout, socket).serve(service).await;
}
