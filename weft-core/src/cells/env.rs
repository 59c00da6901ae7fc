//! Lab Environment
//!
//! Owns the cell registry and the observer signal space. Cells are
//! spawned with a kind and a run closure, then started individually or
//! all at once. The environment is the intended composition root: wire
//! pipes between spawned cells, start everything, and shut down when
//! the work is done.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;

use crate::channels::{CellId, CongestionControlConfig};
use crate::errors::CellError;
use crate::signals::SignalSpace;

use super::controller::CellController;
use super::kind::CellKind;
use super::scope::{CellRun, CellScope};
use super::status::CellStatus;

/// Environment-wide knobs, copied into every cell at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct EnvConfig {
    /// Attaching to an undeclared channel shuts the offending cell
    /// down instead of being logged and dropped.
    pub strict_channels: bool,
    /// Stream backpressure thresholds for every stream send end.
    pub congestion: CongestionControlConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            strict_channels: false,
            congestion: CongestionControlConfig::default(),
        }
    }
}

/// A registry of cells sharing one observer space and one config.
pub struct LabEnv {
    space: SignalSpace,
    cells: DashMap<CellId, Arc<CellController>>,
    config: EnvConfig,
}

impl LabEnv {
    pub fn new() -> Self {
        Self::with_config(EnvConfig::default())
    }

    pub fn with_config(config: EnvConfig) -> Self {
        Self {
            space: SignalSpace::new(),
            cells: DashMap::new(),
            config,
        }
    }

    /// The space observer-side signal views materialize into. Also
    /// usable directly for signals that never leave this process.
    pub fn space(&self) -> &SignalSpace {
        &self.space
    }

    pub fn config(&self) -> EnvConfig {
        self.config
    }

    /// Register a cell. The run closure executes once the cell is
    /// started and every signal input has a value. Names are unique
    /// within an environment.
    pub fn spawn<F, Fut>(
        &self,
        id: impl Into<String>,
        kind: CellKind,
        run: F,
    ) -> Result<Arc<CellController>, CellError>
    where
        F: FnOnce(CellScope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CellError>> + Send + 'static,
    {
        let id = CellId::new(id);
        match self.cells.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CellError::DuplicateCell {
                cell: id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let boxed: CellRun = Box::new(move |scope| run(scope).boxed());
                let controller = Arc::new(CellController::new(
                    id,
                    kind,
                    boxed,
                    self.space.clone(),
                    self.config,
                ));
                slot.insert(Arc::clone(&controller));
                Ok(controller)
            }
        }
    }

    /// Register a cell and start its worker in one step.
    pub async fn start<F, Fut>(
        &self,
        id: impl Into<String>,
        kind: CellKind,
        run: F,
    ) -> Result<Arc<CellController>, CellError>
    where
        F: FnOnce(CellScope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CellError>> + Send + 'static,
    {
        let cell = self.spawn(id, kind, run)?;
        cell.start().await?;
        Ok(cell)
    }

    pub fn cell(&self, id: &str) -> Option<Arc<CellController>> {
        self.cells
            .get(&CellId::new(id))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn cell_ids(&self) -> Vec<CellId> {
        self.cells.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Ids of cells whose workers have started and not yet stopped.
    pub fn running_cell_ids(&self) -> Vec<CellId> {
        self.cells
            .iter()
            .filter(|entry| entry.value().status().is_active())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<CellStatus> {
        self.cell(id).map(|cell| cell.status())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.status(id) == Some(CellStatus::Running)
    }

    /// Start every spawned cell concurrently. Concurrency matters:
    /// piped cells gate on each other's first values, so starting them
    /// one at a time could wait on a cell that has not started yet.
    pub async fn start_all(&self) -> Result<(), CellError> {
        let cells: Vec<Arc<CellController>> = self
            .cells
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let results = futures_util::future::join_all(cells.iter().map(|cell| cell.start())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Abort a cell and drop it from the registry.
    pub fn force_stop(&self, id: &str) -> Result<(), CellError> {
        let (_, cell) = self
            .cells
            .remove(&CellId::new(id))
            .ok_or_else(|| CellError::NoSuchCell {
                cell: id.to_string(),
            })?;
        cell.force_stop();
        Ok(())
    }

    /// Request a finish from every cell, wait for all of them to stop,
    /// then clear the registry. A cell that was spawned but never
    /// started has no worker to wind down and is force-stopped instead.
    pub async fn shutdown(&self) {
        let cells: Vec<Arc<CellController>> = self
            .cells
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for cell in &cells {
            if cell.status() == CellStatus::NotStarted {
                cell.force_stop();
            } else {
                cell.request_finish();
            }
        }
        for cell in &cells {
            cell.finished().await;
        }
        self.cells.clear();
        tracing::debug!(cells = cells.len(), "environment shut down");
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Default for LabEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LabEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabEnv")
            .field("cells", &self.cells.len())
            .field("config", &self.config)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
