//! C9: `FileTransferEngine` — priority-ordered queue of multi-instruction
//! packages with preempt/pause/cancel scheduling (§4.9).

pub mod instruction;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{instrument, warn};

use crate::domain_types::{DeviceId, JobId, Priority, ServerConfigId};
use crate::error::FileTransferError;
use crate::queue::{ItemKind, MessageQueue};

use instruction::{InstructionContext, InstructionEvent, InstructionKind, InstructionProgress};

/// A package's place in the preempt/pause/cancel state machine (§3
/// "File-transfer package", §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Queued,
    Started,
    PreemptionPending,
    Preempted,
    CancellationPending,
    Cancelled,
    PausePending,
    Paused,
    Success,
    Error,
}

/// One server-issued file-transfer job (§3 "File-transfer package").
pub struct Package {
    pub job_id: JobId,
    pub device_id: DeviceId,
    pub server_config_id: ServerConfigId,
    pub state: PackageState,
    pub error: Option<FileTransferError>,
    instructions: Vec<InstructionKind>,
    /// 1-based per §10.8 ("File-transfer instruction index starts at 1, not 0").
    current_instruction_index: usize,
    /// Whether `initialize()` has run for the current instruction yet — each
    /// instruction's `initialized → executing → finished` machine (§4.9) only
    /// initializes once, not on every `process()` tick.
    current_initialized: bool,
    priority: Priority,
}

impl Package {
    #[must_use]
    pub fn new(job_id: JobId, device_id: DeviceId, server_config_id: ServerConfigId, instructions: Vec<InstructionKind>) -> Self {
        Self {
            job_id,
            device_id,
            server_config_id,
            state: PackageState::Queued,
            error: None,
            instructions,
            current_instruction_index: 1,
            current_initialized: false,
            priority: Priority::Normal,
        }
    }

    /// Package priority is the max of its instructions' priorities, recomputed
    /// whenever an instruction is added rather than fixed at creation (§10.8).
    /// Instructions don't carry their own `Priority` in this crate's wire
    /// model (the SOAP attribute is read once, at package-creation time, by
    /// the caller); `add_instruction` is still the right place to keep this
    /// invariant visible as a method rather than a stored-once field.
    pub fn add_instruction(&mut self, instruction: InstructionKind, priority: Priority) {
        self.instructions.push(instruction);
        self.priority = self.priority.max(priority);
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, PackageState::Success | PackageState::Error | PackageState::Cancelled)
    }

    fn current_instruction_mut(&mut self) -> Option<&mut InstructionKind> {
        self.instructions.get_mut(self.current_instruction_index - 1)
    }

    fn is_pending_request(&self) -> bool {
        self.instructions
            .get(self.current_instruction_index - 1)
            .is_some_and(InstructionKind::is_pending_request)
    }
}

/// Status update emitted after every package tick (§4.9 "Status transitions
/// are reported to the server via a `PackageStatus` item").
struct PackageStatus<'a> {
    job_id: JobId,
    status: PackageState,
    error_code: Option<&'a FileTransferError>,
    instruction_index: usize,
}

fn render_package_status(status: &PackageStatus<'_>) -> Bytes {
    let status_code: u32 = match status.status {
        PackageState::Success => 0,
        PackageState::Error => 1,
        PackageState::Cancelled => 2,
        _ => 3,
    };
    let error_code = status.error_code.map(|_| 1u32).unwrap_or(0);
    let xml = format!(
        "<Ps jobId=\"{}\" sc=\"{:X}\" ec=\"{:X}\" ii=\"{}\"/>",
        status.job_id, status_code, error_code, status.instruction_index
    );
    Bytes::from(xml.into_bytes())
}

/// Priority-ordered package scheduler (§4.9).
pub struct FileTransferEngine {
    packages: Vec<Package>,
    queue: MessageQueue,
    context: InstructionContext,
}

impl FileTransferEngine {
    #[must_use]
    pub fn new(queue: MessageQueue, context: InstructionContext) -> Self {
        Self { packages: Vec::new(), queue, context }
    }

    /// Adds a newly-parsed package, keeping `self.packages` priority-sorted
    /// (highest first), matching the queue insertion order for equal
    /// priorities (§5 "File-transfer packages of the same priority execute in
    /// insertion order").
    pub fn submit(&mut self, package: Package) {
        let insert_at = self.packages.iter().position(|p| p.priority() < package.priority()).unwrap_or(self.packages.len());
        self.packages.insert(insert_at, package);
    }

    /// Marks the package's current instruction for cancellation/pause at its
    /// next safe point (§5 "the effect is deferred to a safe point
    /// (`is-pending-request == false`)").
    pub fn request_cancel(&mut self, job_id: JobId) {
        if let Some(p) = self.packages.iter_mut().find(|p| p.job_id == job_id) {
            if p.current_instruction_index == 1 && !p.current_initialized {
                p.state = PackageState::Cancelled;
            } else {
                p.state = PackageState::CancellationPending;
            }
        }
    }

    pub fn request_pause(&mut self, job_id: JobId) {
        if let Some(p) = self.packages.iter_mut().find(|p| p.job_id == job_id) {
            p.state = PackageState::PausePending;
        }
    }

    /// Runs one bounded scheduling step (§4.9 "Scheduling").
    #[instrument(skip(self))]
    pub async fn process(&mut self) {
        self.apply_preemption();
        self.advance_pending_transitions().await;

        let Some(index) = self.packages.iter().position(|p| {
            matches!(p.state, PackageState::Started | PackageState::Queued | PackageState::Preempted)
        }) else {
            return;
        };

        self.run_package(index).await;
        self.report_terminal_and_reap().await;
    }

    fn apply_preemption(&mut self) {
        if self.packages.is_empty() {
            return;
        }
        let head_priority = self.packages[0].priority();
        for package in self.packages.iter_mut().skip(1) {
            if matches!(package.state, PackageState::Started) && package.priority() <= head_priority {
                if !package.is_pending_request() {
                    package.state = PackageState::Preempted;
                } else {
                    package.state = PackageState::PreemptionPending;
                }
            }
        }
    }

    /// Ticks every package currently waiting for a safe point
    /// (`preemption-pending`/`cancellation-pending`/`pause-pending`) so it
    /// can actually reach one, then transitions it once `is-pending-request`
    /// goes false (§5 "the effect is deferred to a safe point").
    async fn advance_pending_transitions(&mut self) {
        for package in &mut self.packages {
            let awaiting_safe_point = matches!(
                package.state,
                PackageState::PreemptionPending | PackageState::CancellationPending | PackageState::PausePending
            );
            if !awaiting_safe_point {
                continue;
            }
            if package.is_pending_request() {
                if let Some(instr) = package.current_instruction_mut() {
                    let _ = instr.process(&self.context).await;
                }
            }
            if !package.is_pending_request() {
                package.state = match package.state {
                    PackageState::PreemptionPending => PackageState::Preempted,
                    PackageState::CancellationPending => PackageState::Cancelled,
                    PackageState::PausePending => PackageState::Paused,
                    other => other,
                };
                if matches!(package.state, PackageState::Preempted) {
                    if let Some(instr) = package.current_instruction_mut() {
                        instr.notify(InstructionEvent::Preempt);
                    }
                }
            }
        }
    }

    async fn run_package(&mut self, index: usize) {
        let package = &mut self.packages[index];
        if matches!(package.state, PackageState::Preempted) {
            if let Some(instr) = package.current_instruction_mut() {
                instr.notify(InstructionEvent::Reactivated);
            }
        }
        package.state = PackageState::Started;

        let needs_init = !package.current_initialized;
        let Some(instr) = package.current_instruction_mut() else {
            package.state = PackageState::Success;
            return;
        };

        if needs_init {
            if let Err(err) = instr.initialize(&self.context).await {
                package.error = Some(err);
                package.state = PackageState::Error;
                return;
            }
            package.current_initialized = true;
        }

        match instr.process(&self.context).await {
            Ok(InstructionProgress::InProgress) => {}
            Ok(InstructionProgress::Finished) => {
                instr.destroy();
                let total = package.instructions.len();
                if package.current_instruction_index >= total {
                    package.state = PackageState::Success;
                } else {
                    package.current_instruction_index += 1;
                    package.current_initialized = false;
                }
            }
            Err(err) => {
                warn!(job_id = %package.job_id, error = %err, "file-transfer instruction failed");
                package.error = Some(err);
                package.state = PackageState::Error;
            }
        }

        if matches!(package.state, PackageState::CancellationPending) && !package.is_pending_request() {
            package.state = PackageState::Cancelled;
        }
        if matches!(package.state, PackageState::PausePending) && !package.is_pending_request() {
            package.state = PackageState::Paused;
        }
    }

    async fn report_terminal_and_reap(&mut self) {
        let mut to_remove = Vec::new();
        for (i, package) in self.packages.iter().enumerate() {
            if package.is_terminal() {
                to_remove.push(i);
            }
        }
        for &i in to_remove.iter().rev() {
            let package = &self.packages[i];
            let status = PackageStatus {
                job_id: package.job_id,
                status: package.state,
                error_code: package.error.as_ref(),
                instruction_index: package.current_instruction_index,
            };
            let xml = render_package_status(&status);
            if let Err(err) = self
                .queue
                .add(ItemKind::Misc, package.device_id, package.server_config_id, Priority::High, xml)
                .await
            {
                warn!(error = %err, "dropping terminal package-status: queue is full");
            }
            self.packages.remove(i);
        }
    }

    #[must_use]
    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// The current state of a still-queued package, if it hasn't already
    /// reached a terminal state and been reaped.
    #[must_use]
    pub fn package_state(&self, job_id: JobId) -> Option<PackageState> {
        self.packages.iter().find(|p| p.job_id == job_id).map(|p| p.state)
    }
}

/// Builds [`InstructionKind`]s for a freshly-parsed package from a SOAP
/// method's attribute map (§6 "File-transfer wire").
#[must_use]
pub fn instruction_from_method(method: &str, attrs: &HashMap<String, String>, base_dir: &std::path::Path) -> Result<InstructionKind, FileTransferError> {
    match method {
        "FileTransfer.Download" => instruction::DownloadInstruction::from_attrs(attrs, base_dir).map(InstructionKind::Download),
        "FileTransfer.Upload" => instruction::UploadInstruction::from_attrs(attrs, base_dir).map(InstructionKind::Upload),
        other => Err(FileTransferError::UnsupportedFunction(other.to_string())),
    }
}
