// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulated TPM 2.0 Command Response Buffer (CRB) interface.
//!
//! This implements the memory-mapped register protocol a guest uses to
//! submit TPM commands and collect responses, as defined in the TCG PC
//! Client Platform TPM Profile (PTP) specification. Command execution
//! itself lives behind the [`backend::TpmBackend`] boundary: the device
//! hands off raw command bytes, the executor completes asynchronously, and
//! the completion is folded back into the register state on the device's
//! poll path.
//!
//! Locality 0 only; the FIFO (TIS) interface is not supported.

pub mod backend;
pub mod buffer;
pub mod spec;

use crate::backend::CommandHandle;
use crate::backend::Completion;
use crate::backend::CompletionQueue;
use crate::backend::TpmBackend;
use crate::backend::TpmVersion;
use crate::buffer::DataBuffer;
use crate::spec::CrbReg;
use crate::spec::CtrlIntEnable;
use crate::spec::CtrlIntStatus;
use crate::spec::CtrlReq;
use crate::spec::CtrlStatus;
use crate::spec::InterfaceId;
use crate::spec::InterfaceId2;
use crate::spec::LocCtrl;
use crate::spec::LocState;
use crate::spec::LocStatus;
use crate::spec::RegisterFile;
use crate::spec::CRB_DATA_BUFFER_OFFSET;
use crate::spec::CRB_DATA_BUFFER_SIZE;
use crate::spec::CRB_INVOKE;
use crate::spec::CRB_MMIO_REGION_SIZE;
use std::ops::RangeInclusive;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;

/// Architectural base address of the CRB interface on x86 platforms.
pub const TPM_CRB_MMIO_REGION_BASE_ADDRESS: u64 = 0xfed4_0000;

/// Errors fatal to device creation.
///
/// A system carries at most one TPM and the guest has no way to probe a
/// broken one, so the device refuses to come up rather than emulating a
/// non-functional interface.
#[derive(Debug, Error)]
pub enum TpmCrbError {
    #[error("no TPM backend available")]
    NoBackend,
    #[error("at most one TPM device is permitted")]
    TpmAlreadyPresent,
    #[error("backend implements {0:?}, but the CRB interface requires TPM 2.0")]
    UnsupportedVersion(TpmVersion),
    #[error("physical presence interface enabled without a collaborator")]
    PpiNotSupplied,
}

/// An MMIO access the device cannot service.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("no device register at the requested offset")]
    InvalidRegister,
    #[error("invalid access size for the requested offset")]
    InvalidAccessSize,
    #[error("unaligned register access")]
    UnalignedAccess,
    #[error(transparent)]
    OutOfRange(#[from] buffer::OutOfRange),
}

/// Platform lookup consulted at creation time to enforce the system-wide
/// single-TPM constraint.
pub trait TpmRegistry {
    /// Returns true if a TPM device already exists in the system.
    fn tpm_present(&self) -> bool;
}

/// Opaque handle to the ACPI physical-presence side channel.
///
/// The CRB core never interprets PPI state; it only keeps the collaborator's
/// lifecycle in step with the device.
pub trait PhysicalPresence: Send {
    /// Re-arms the side channel across a platform reset.
    fn reset(&mut self);
}

/// Static configuration.
pub struct TpmCrbConfig {
    /// Guest physical address the control area is mapped at.
    pub base_address: u64,
    /// Whether the physical-presence side channel is wired up.
    pub ppi_enabled: bool,
}

impl Default for TpmCrbConfig {
    fn default() -> Self {
        Self {
            base_address: TPM_CRB_MMIO_REGION_BASE_ADDRESS,
            ppi_enabled: true,
        }
    }
}

/// Runtime collaborators handed in by the host.
pub struct TpmCrbRuntimeDeps {
    /// The command executor. `None` (the host found no usable backend) fails
    /// device creation.
    pub backend: Option<Box<dyn TpmBackend>>,
    /// Consumer half of the queue the backend posts completions into; see
    /// [`backend::completion_channel`].
    pub completions: CompletionQueue,
    /// Required when [`TpmCrbConfig::ppi_enabled`] is set.
    pub ppi: Option<Box<dyn PhysicalPresence>>,
}

/// Where the command interface stands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CrbState {
    /// Quiescent: power-on state, or the guest requested go-idle.
    Idle,
    /// Locality held and idle cleared; the buffer may be loaded.
    Ready,
    /// A command is in the backend's hands.
    Executing,
    /// The response is in the buffer.
    Complete,
    /// The backend reported a failure; waiting for the guest to go idle.
    Failed,
}

struct PendingCommand {
    handle: CommandHandle,
    cancel_requested: bool,
}

/// The TPM CRB interface device.
pub struct TpmCrb {
    // Static configuration
    mmio_region: (&'static str, RangeInclusive<u64>),
    base_address: u64,

    // Runtime glue
    backend: Box<dyn TpmBackend>,
    completions: CompletionQueue,
    ppi: Option<Box<dyn PhysicalPresence>>,

    // Volatile state
    regs: RegisterFile,
    buffer: DataBuffer,
    state: CrbState,
    pending: Option<PendingCommand>,
    next_handle: u64,
}

impl TpmCrb {
    pub fn new(
        config: TpmCrbConfig,
        deps: TpmCrbRuntimeDeps,
        registry: &dyn TpmRegistry,
    ) -> Result<Self, TpmCrbError> {
        if registry.tpm_present() {
            return Err(TpmCrbError::TpmAlreadyPresent);
        }

        let backend = deps.backend.ok_or(TpmCrbError::NoBackend)?;

        let version = backend.version();
        if version != TpmVersion::V2_0 {
            return Err(TpmCrbError::UnsupportedVersion(version));
        }

        let ppi = if config.ppi_enabled {
            Some(deps.ppi.ok_or(TpmCrbError::PpiNotSupplied)?)
        } else {
            None
        };

        tracing::info!(
            base_address = config.base_address,
            "initializing TPM CRB interface"
        );

        let mut tpm = Self {
            mmio_region: (
                "tpm_crb",
                config.base_address..=config.base_address + CRB_MMIO_REGION_SIZE - 1,
            ),
            base_address: config.base_address,
            backend,
            completions: deps.completions,
            ppi,
            regs: RegisterFile::new(),
            buffer: DataBuffer::new(),
            state: CrbState::Idle,
            pending: None,
            next_handle: 0,
        };
        tpm.reset();
        Ok(tpm)
    }

    /// The MMIO region the host should route to this device.
    pub fn mmio_region(&self) -> (&'static str, RangeInclusive<u64>) {
        self.mmio_region.clone()
    }

    /// Returns the device to its power-on state.
    ///
    /// Safe to invoke from any state. An in-flight backend submission is
    /// abandoned; its completion, if it ever arrives, no longer matches a
    /// pending handle and is dropped.
    pub fn reset(&mut self) {
        self.pending = None;
        self.state = CrbState::Idle;
        self.buffer.clear();
        self.regs = initial_registers(self.base_address);
        if let Some(ppi) = &mut self.ppi {
            ppi.reset();
        }
    }

    pub fn mmio_read(&mut self, address: u64, data: &mut [u8]) -> Result<(), IoError> {
        let offset = self.region_offset(address)?;

        if offset >= CRB_DATA_BUFFER_OFFSET {
            let buffer_offset = (offset - CRB_DATA_BUFFER_OFFSET) as usize;
            self.buffer.read_bytes(buffer_offset, data)?;
            return Ok(());
        }

        // Sub-word reads are floored to the containing register; some guests
        // (Linux under TDX, for one) read fields byte by byte.
        let floor = offset & !0x3;
        let byte_offset = (offset - floor) as usize;

        match data.len() {
            1 | 2 | 4 => {}
            // The 64-bit identifier and buffer-address quantities span two
            // adjacent registers and may be read in one access.
            8 if matches!(
                CrbReg(offset),
                CrbReg::INTF_ID | CrbReg::CTRL_CMD_LADDR | CrbReg::CTRL_RSP_LADDR
            ) => {}
            _ => return Err(IoError::InvalidAccessSize),
        }

        let mut value = self.register_value(CrbReg(floor))? as u64;
        if data.len() == 8 {
            value |= (self.register_value(CrbReg(floor + 4))? as u64) << 32;
        }

        tracing::trace!(offset, value, "tpm crb mmio read");

        let bytes = value.to_le_bytes();
        data.copy_from_slice(&bytes[byte_offset..byte_offset + data.len()]);
        Ok(())
    }

    pub fn mmio_write(&mut self, address: u64, data: &[u8]) -> Result<(), IoError> {
        let offset = self.region_offset(address)?;

        if offset >= CRB_DATA_BUFFER_OFFSET {
            let buffer_offset = (offset - CRB_DATA_BUFFER_OFFSET) as usize;
            self.buffer.write_bytes(buffer_offset, data)?;
            return Ok(());
        }

        if !matches!(data.len(), 1 | 2 | 4) {
            // Some guests write the response-address pair as a single 64-bit
            // access. The registers are read-only, so the write is ignored
            // rather than faulted.
            if data.len() == 8 && CrbReg(offset) == CrbReg::CTRL_RSP_LADDR {
                tracing::trace!("ignored 64-bit write to response address");
                return Ok(());
            }
            return Err(IoError::InvalidAccessSize);
        }
        if offset & 0x3 != 0 {
            return Err(IoError::UnalignedAccess);
        }

        let mut bytes = [0u8; 4];
        bytes[..data.len()].copy_from_slice(data);
        let value = u32::from_le_bytes(bytes);

        tracing::trace!(offset, value, "tpm crb mmio write");

        self.control_write(CrbReg(offset), value)
    }

    /// Drains backend completions and folds them into the register state.
    ///
    /// This is the device's single asynchronous re-entry point; the host
    /// calls it from the device's poll context, so transitions are evaluated
    /// serially with guest register accesses.
    pub fn poll_completions(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(completion) = self.completions.poll_next(cx) {
            self.process_completion(completion);
        }
    }

    fn region_offset(&self, address: u64) -> Result<u64, IoError> {
        address
            .checked_sub(self.base_address)
            .filter(|&offset| offset < CRB_MMIO_REGION_SIZE)
            .ok_or(IoError::InvalidRegister)
    }

    fn register_value(&self, reg: CrbReg) -> Result<u32, IoError> {
        match reg {
            // LOC_CTRL and CTRL_REQ hold requests, not state: LOC_CTRL is
            // write-only and CTRL_REQ is self-clearing, so neither is ever
            // stored and both read back as zero.
            CrbReg::LOC_STATE
            | CrbReg::LOC_CTRL
            | CrbReg::LOC_STS
            | CrbReg::INTF_ID
            | CrbReg::INTF_ID2
            | CrbReg::CTRL_EXT
            | CrbReg::CTRL_REQ
            | CrbReg::CTRL_STS
            | CrbReg::CTRL_CANCEL
            | CrbReg::CTRL_START
            | CrbReg::CTRL_INT_ENABLE
            | CrbReg::CTRL_INT_STS
            | CrbReg::CTRL_CMD_SIZE
            | CrbReg::CTRL_CMD_LADDR
            | CrbReg::CTRL_CMD_HADDR
            | CrbReg::CTRL_RSP_SIZE
            | CrbReg::CTRL_RSP_LADDR
            | CrbReg::CTRL_RSP_HADDR => Ok(self.regs.read(reg)),
            _ => Err(IoError::InvalidRegister),
        }
    }

    fn control_write(&mut self, reg: CrbReg, value: u32) -> Result<(), IoError> {
        match reg {
            CrbReg::LOC_CTRL => self.locality_control(LocCtrl::from(value)),
            CrbReg::CTRL_REQ => self.control_request(CtrlReq::from(value)),
            CrbReg::CTRL_CANCEL => self.control_cancel(value),
            CrbReg::CTRL_START => self.control_start(value),
            CrbReg::CTRL_INT_ENABLE => {
                let requested = CtrlIntEnable::from(value);
                self.regs.write(
                    CrbReg::CTRL_INT_ENABLE,
                    CtrlIntEnable::new()
                        .with_start_enable(requested.start_enable())
                        .with_global_enable(requested.global_enable())
                        .into(),
                );
            }
            CrbReg::CTRL_INT_STS => {
                // Write-one-to-clear.
                let latched = self.regs.int_status();
                let cleared = CtrlIntStatus::from(value);
                self.regs.set_int_status(
                    latched.with_start_complete(
                        latched.start_complete() && !cleared.start_complete(),
                    ),
                );
            }
            CrbReg::LOC_STATE
            | CrbReg::LOC_STS
            | CrbReg::INTF_ID
            | CrbReg::INTF_ID2
            | CrbReg::CTRL_EXT
            | CrbReg::CTRL_STS
            | CrbReg::CTRL_CMD_SIZE
            | CrbReg::CTRL_CMD_LADDR
            | CrbReg::CTRL_CMD_HADDR
            | CrbReg::CTRL_RSP_SIZE
            | CrbReg::CTRL_RSP_LADDR
            | CrbReg::CTRL_RSP_HADDR => {
                tracing::debug!(offset = reg.0, value, "write to read-only register ignored");
            }
            _ => return Err(IoError::InvalidRegister),
        }
        Ok(())
    }

    fn locality_granted(&self) -> bool {
        self.regs.loc_state().loc_assigned()
    }

    fn locality_control(&mut self, request: LocCtrl) {
        if request.request_access() {
            self.regs.set_loc_state(
                self.regs
                    .loc_state()
                    .with_loc_assigned(true)
                    .with_active_locality(0),
            );
            self.regs.set_loc_status(
                LocStatus::new().with_granted(true).with_been_seized(false),
            );
        }
        if request.relinquish() {
            self.regs
                .set_loc_state(self.regs.loc_state().with_loc_assigned(false));
            self.regs
                .set_loc_status(self.regs.loc_status().with_granted(false));
        }
        if request.seize() || request.reset_establishment_bit() {
            // Seize is defined for locality 4 only, and the establishment
            // flag belongs to the backend; neither applies here.
            tracing::debug!("unsupported locality control request ignored");
        }
    }

    fn control_request(&mut self, request: CtrlReq) {
        if request.cmd_ready() && request.go_idle() {
            tracing::debug!("conflicting control request ignored");
            return;
        }
        if request.cmd_ready() {
            if !self.locality_granted() {
                tracing::debug!("cmdReady without an active locality ignored");
                return;
            }
            self.regs
                .set_ctrl_status(self.regs.ctrl_status().with_tpm_idle(false));
            if self.state == CrbState::Idle {
                self.state = CrbState::Ready;
            }
        }
        if request.go_idle() {
            self.go_idle();
        }
    }

    /// Returns the interface to idle, discarding any transaction in
    /// progress. The error flag, the start and cancel latches, and the
    /// interrupt latch all clear; locality assignment is unaffected.
    fn go_idle(&mut self) {
        self.pending = None;
        self.state = CrbState::Idle;
        self.regs.set_ctrl_status(
            self.regs
                .ctrl_status()
                .with_tpm_idle(true)
                .with_tpm_sts(false),
        );
        self.regs.write(CrbReg::CTRL_START, 0);
        self.regs.write(CrbReg::CTRL_CANCEL, 0);
        self.regs.set_int_status(CtrlIntStatus::new());
    }

    fn control_start(&mut self, value: u32) {
        if value != CRB_INVOKE {
            return;
        }
        if !self.locality_granted() {
            tracing::debug!("start without an active locality ignored");
            return;
        }
        if self.regs.ctrl_status().tpm_idle() {
            tracing::debug!("start while idle ignored");
            return;
        }
        if self.pending.is_some() {
            // At most one command in flight; a second start is neither
            // queued nor faulted.
            tracing::debug!("start while a command is pending ignored");
            return;
        }

        let handle = CommandHandle(self.next_handle);
        self.next_handle += 1;

        // Snapshot the command so later buffer writes cannot alias the bytes
        // the backend is working on.
        let command = self.buffer.loaded().to_vec();

        self.regs.write(CrbReg::CTRL_START, CRB_INVOKE);
        // A fresh transaction; a leftover error indication from the previous
        // one no longer applies.
        self.regs
            .set_ctrl_status(self.regs.ctrl_status().with_tpm_sts(false));

        tracing::debug!(len = command.len(), "submitting guest TPM command");

        match self.backend.submit(handle, &command) {
            Ok(()) => {
                self.pending = Some(PendingCommand {
                    handle,
                    cancel_requested: false,
                });
                self.state = CrbState::Executing;
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "TPM backend rejected command"
                );
                self.command_failed();
            }
        }
    }

    fn control_cancel(&mut self, value: u32) {
        if value & CRB_INVOKE != 0 {
            if let Some(pending) = &mut self.pending {
                pending.cancel_requested = true;
                self.regs.write(CrbReg::CTRL_CANCEL, CRB_INVOKE);
                self.backend.cancel();
            } else {
                tracing::debug!("cancel with no command pending ignored");
            }
        } else {
            self.regs.write(CrbReg::CTRL_CANCEL, 0);
        }
    }

    fn process_completion(&mut self, completion: Completion) {
        let Some(pending) = &self.pending else {
            // A completion for a submission abandoned by reset or go-idle.
            tracing::debug!(?completion.handle, "dropping stale TPM completion");
            return;
        };
        if pending.handle != completion.handle {
            tracing::debug!(?completion.handle, "dropping stale TPM completion");
            return;
        }

        let cancel_requested = pending.cancel_requested;
        self.pending = None;

        if cancel_requested {
            // Cancellation acknowledged, however the backend finished. The
            // buffer contents are undefined to the guest until reloaded.
            self.regs.write(CrbReg::CTRL_START, 0);
            self.regs.write(CrbReg::CTRL_CANCEL, 0);
            self.state = CrbState::Ready;
            return;
        }

        match completion.result {
            Ok(response) => self.command_completed(&response),
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "TPM backend reported command failure"
                );
                self.command_failed();
            }
        }
    }

    fn command_completed(&mut self, response: &[u8]) {
        if self.buffer.store_response(response).is_err() {
            tracing::warn!(
                len = response.len(),
                "TPM response exceeds the data buffer"
            );
            self.command_failed();
            return;
        }

        self.regs.write(CrbReg::CTRL_START, 0);
        self.state = CrbState::Complete;

        if self.regs.int_enable().start_enable() {
            self.regs
                .set_int_status(self.regs.int_status().with_start_complete(true));
        }
    }

    fn command_failed(&mut self) {
        self.regs
            .set_ctrl_status(self.regs.ctrl_status().with_tpm_sts(true));
        self.regs.write(CrbReg::CTRL_START, 0);
        self.state = CrbState::Failed;
    }
}

fn initial_registers(base_address: u64) -> RegisterFile {
    let mut regs = RegisterFile::new();

    regs.set_loc_state(LocState::new().with_tpm_reg_valid_sts(true));
    regs.set_ctrl_status(CtrlStatus::new().with_tpm_idle(true));

    regs.write(
        CrbReg::INTF_ID,
        InterfaceId::new()
            .with_interface_type(spec::INTF_TYPE_CRB_ACTIVE)
            .with_interface_version(spec::INTF_VERSION_CRB)
            .with_cap_locality(spec::INTF_CAP_LOCALITY_0_ONLY)
            .with_cap_crb_idle_bypass(spec::INTF_CAP_IDLE_FAST)
            .with_cap_data_xfer_size(spec::INTF_CAP_XFER_SIZE_64)
            .with_cap_fifo(spec::INTF_CAP_FIFO_NOT_SUPPORTED)
            .with_cap_crb(spec::INTF_CAP_CRB_SUPPORTED)
            .with_interface_selector(spec::INTF_SELECTOR_CRB)
            .with_rid(0)
            .into(),
    );
    regs.write(
        CrbReg::INTF_ID2,
        InterfaceId2::new().with_vid(spec::INTF_VID_IBM).into(),
    );

    let buffer_address = base_address + CRB_DATA_BUFFER_OFFSET;
    regs.write(CrbReg::CTRL_CMD_SIZE, CRB_DATA_BUFFER_SIZE as u32);
    regs.write(CrbReg::CTRL_CMD_LADDR, buffer_address as u32);
    regs.write(CrbReg::CTRL_CMD_HADDR, (buffer_address >> 32) as u32);
    regs.write(CrbReg::CTRL_RSP_SIZE, CRB_DATA_BUFFER_SIZE as u32);
    regs.write(CrbReg::CTRL_RSP_LADDR, buffer_address as u32);
    regs.write(CrbReg::CTRL_RSP_HADDR, (buffer_address >> 32) as u32);

    regs
}

mod save_restore {
    use super::*;
    use crate::spec::REGISTER_COUNT;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Raw register snapshot; the persisted form of the device.
    ///
    /// Buffer contents are not persisted: outside a completed transaction
    /// they are undefined to the guest, and a save is refused while a
    /// transaction is outstanding.
    #[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
    #[repr(C)]
    pub struct SavedState {
        pub regs: [u32; REGISTER_COUNT],
    }

    #[derive(Debug, Error)]
    pub enum SaveError {
        #[error("save is blocked while a TPM command is outstanding")]
        OutstandingCommand,
    }

    impl TpmCrb {
        pub fn save(&self) -> Result<SavedState, SaveError> {
            if self.pending.is_some() {
                return Err(SaveError::OutstandingCommand);
            }
            Ok(SavedState {
                regs: self.regs.raw(),
            })
        }

        pub fn restore(&mut self, saved: &SavedState) {
            self.regs.load_raw(saved.regs);
            self.pending = None;
            self.buffer.clear();

            // A snapshot cannot carry an in-flight command (save refuses
            // one), so the start latch is clear and the phase follows from
            // the status bits alone.
            self.regs.write(CrbReg::CTRL_START, 0);
            let status = self.regs.ctrl_status();
            self.state = if status.tpm_idle() {
                CrbState::Idle
            } else if status.tpm_sts() {
                CrbState::Failed
            } else {
                CrbState::Ready
            };
        }
    }
}

pub use save_restore::SaveError;
pub use save_restore::SavedState;
