//! Serialized document updates.
//!
//! ## Learning: Async Mutex as a Queue
//!
//! `tokio::sync::Mutex` hands out its guard in FIFO order. Holding it for the
//! whole rebuild means a second `update_documents` call waits behind the
//! first instead of interleaving with it or being dropped. Feature
//! integrations that need a consistent view take the same lock through
//! [`UpdateManager::with_update_lock`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::block::BlockInput;
use crate::editor::EditorId;
use crate::signal::Signal;
use crate::virtual_document::VirtualDocument;
use crate::{CoreError, CoreResult};

/// A block accepted into a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAdded {
    pub editor: EditorId,

    /// Position of the block in the update's input
    pub index: usize,
}

/// Rebuilds one root virtual document at a time.
pub struct UpdateManager {
    document: Arc<VirtualDocument>,
    update_lock: Mutex<()>,
    in_progress: AtomicBool,
    disposed: AtomicBool,

    update_began: Signal<usize>,
    block_added: Signal<BlockAdded>,
    update_finished: Signal<usize>,
    document_updated: Signal<Arc<VirtualDocument>>,
}

impl UpdateManager {
    pub fn new(document: Arc<VirtualDocument>) -> Self {
        Self {
            document,
            update_lock: Mutex::new(()),
            in_progress: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            update_began: Signal::new(),
            block_added: Signal::new(),
            update_finished: Signal::new(),
            document_updated: Signal::new(),
        }
    }

    pub fn document(&self) -> &Arc<VirtualDocument> {
        &self.document
    }

    /// Rebuilds the document from `blocks`.
    ///
    /// Waits for any update already running. Blocks whose editor was
    /// disposed in the meantime are skipped.
    pub async fn update_documents(&self, blocks: Vec<BlockInput>) -> CoreResult<()> {
        let _guard = self.update_lock.lock().await;
        if self.is_disposed() || self.document.is_disposed() {
            return Err(CoreError::Disposed(self.document.id_path()));
        }

        self.in_progress.store(true, Ordering::SeqCst);
        self.rebuild(&blocks);
        self.in_progress.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn rebuild(&self, blocks: &[BlockInput]) {
        tracing::trace!(
            "Rebuilding {} from {} blocks",
            self.document.id_path(),
            blocks.len()
        );
        self.update_began.emit(blocks.len());
        self.document.begin_rebuild();

        for (index, block) in blocks.iter().enumerate() {
            if block.editor.is_disposed() {
                tracing::debug!("Skipping block {} of disposed editor", index);
                continue;
            }
            self.document.append_code_block(block);
            self.block_added.emit(BlockAdded {
                editor: block.editor.id(),
                index,
            });
        }

        self.document.finish_rebuild();
        self.update_finished.emit(blocks.len());
        self.document_updated.emit(self.document.clone());
        self.document.maybe_emit_changed();
    }

    /// Runs `f` while no update can start.
    pub async fn with_update_lock<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce(Arc<VirtualDocument>) -> Fut,
        Fut: Future<Output = R>,
    {
        let _guard = self.update_lock.lock().await;
        f(self.document.clone()).await
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn update_began(&self) -> &Signal<usize> {
        &self.update_began
    }

    pub fn block_added(&self) -> &Signal<BlockAdded> {
        &self.block_added
    }

    pub fn update_finished(&self) -> &Signal<usize> {
        &self.update_finished
    }

    pub fn document_updated(&self) -> &Signal<Arc<VirtualDocument>> {
        &self.document_updated
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stops accepting updates. Safe to call more than once.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
