//! # Command Bundle
//!
//! A [`CommandBundle`] binds a context, device, command list and (in deferred
//! mode) a command queue, and exposes one submission interface over both
//! execution strategies:
//!
//! 1.  **Immediate**: the list is an immediate command list with its queue
//!     embedded. Commands start executing as they are appended and
//!     `submit_and_wait` is a pure host wait on the list.
//! 2.  **Deferred**: commands are recorded into a regular list. The list is
//!     closed, executed on the bundle's own queue, and the queue is
//!     synchronized.
//!
//! ```text
//!  Created --append--> Appending --close--> Closed --submit--> Submitted --wait--> Idle
//!                          ^                                                         |
//!                          +-------------------------append (reset)------------------+
//! ```
//!
//! Immediate bundles never enter `Closed`. A timeout during the wait is
//! reported as [`BundleError::Timeout`], never folded into driver failures,
//! and leaves the bundle `Submitted` until a later wait succeeds.
//! `destroy` consumes the bundle, so a destroyed bundle cannot be used or
//! destroyed again; dropping an undestroyed bundle releases it exactly once.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::driver::{
    Command, DeviceHandle, DriverError, GroupCount, ListHandle, QueueDesc, QueueFlags, QueueHandle,
    QueueMode, QueuePriority, Timeout,
};
use crate::kernel::Kernel;
use crate::runtime::Context;

/// How a bundle submits its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Immediate,
    Deferred,
}

impl ExecutionMode {
    /// Decodes the worker command-line flag: `0` is deferred, anything else immediate.
    pub fn from_flag(flag: i64) -> Self {
        if flag == 0 {
            ExecutionMode::Deferred
        } else {
            ExecutionMode::Immediate
        }
    }

    pub fn flag(self) -> i64 {
        match self {
            ExecutionMode::Immediate => 1,
            ExecutionMode::Deferred => 0,
        }
    }

    pub fn is_immediate(self) -> bool {
        self == ExecutionMode::Immediate
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Immediate => write!(f, "immediate"),
            ExecutionMode::Deferred => write!(f, "deferred"),
        }
    }
}

/// Creation parameters of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleDesc {
    pub flags: QueueFlags,
    pub queue_mode: QueueMode,
    pub priority: QueuePriority,
    /// Command queue group ordinal.
    pub ordinal: u32,
    /// Queue index within the group.
    pub index: u32,
    pub execution: ExecutionMode,
}

impl BundleDesc {
    /// Default flags, mode and priority on queue 0 of group `ordinal`.
    pub fn new(ordinal: u32, execution: ExecutionMode) -> Self {
        Self {
            flags: QueueFlags::empty(),
            queue_mode: QueueMode::Default,
            priority: QueuePriority::Normal,
            ordinal,
            index: 0,
            execution,
        }
    }

    fn queue_desc(&self) -> QueueDesc {
        QueueDesc {
            ordinal: self.ordinal,
            index: self.index,
            flags: self.flags,
            mode: self.queue_mode,
            priority: self.priority,
        }
    }
}

/// Errors raised by bundle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("device work did not complete within {0}")]
    Timeout(Timeout),
    #[error("close is not valid on an immediate bundle")]
    CloseOnImmediate,
    #[error("command list is already closed")]
    AlreadyClosed,
    #[error("cannot append to a closed command list before it is submitted")]
    ListClosed,
    #[error("submitted work is still in flight; wait for it before appending")]
    InFlight,
}

/// Lifecycle position of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Created,
    Appending,
    Closed,
    /// Work was handed to the device and a wait timed out before it finished.
    Submitted,
    /// All submitted work completed; appending starts a new recording.
    Idle,
}

#[derive(Debug, Clone, Copy)]
enum Submission {
    Immediate,
    Deferred { queue: QueueHandle },
}

/// A command list plus the means to submit and wait for it.
pub struct CommandBundle<'c> {
    context: &'c Context,
    list: ListHandle,
    submission: Submission,
    state: BundleState,
    appended: u64,
    released: bool,
}

impl<'c> CommandBundle<'c> {
    /// Creates the list (and queue for deferred bundles) on `device`.
    ///
    /// Fails with the driver's error if the ordinal does not exist or the
    /// device rejects the queue flags.
    pub fn create(
        context: &'c Context,
        device: DeviceHandle,
        desc: &BundleDesc,
    ) -> Result<Self, BundleError> {
        let driver = context.driver();
        let queue_desc = desc.queue_desc();

        let (list, submission) = match desc.execution {
            ExecutionMode::Immediate => {
                let list =
                    driver.create_immediate_command_list(context.handle(), device, &queue_desc)?;
                (list, Submission::Immediate)
            }
            ExecutionMode::Deferred => {
                let queue = driver.create_command_queue(context.handle(), device, &queue_desc)?;
                let list = match driver.create_command_list(context.handle(), device, desc.ordinal)
                {
                    Ok(list) => list,
                    Err(e) => {
                        if let Err(cleanup) = driver.destroy_command_queue(queue) {
                            warn!("Failed to destroy queue after list creation error: {}", cleanup);
                        }
                        return Err(e.into());
                    }
                };
                (list, Submission::Deferred { queue })
            }
        };

        debug!(
            "Created {} bundle on ordinal {} (list {:#x})",
            desc.execution,
            desc.ordinal,
            list.raw()
        );

        Ok(Self {
            context,
            list,
            submission,
            state: BundleState::Created,
            appended: 0,
            released: false,
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.submission {
            Submission::Immediate => ExecutionMode::Immediate,
            Submission::Deferred { .. } => ExecutionMode::Deferred,
        }
    }

    pub fn state(&self) -> BundleState {
        self.state
    }

    pub fn list(&self) -> ListHandle {
        self.list
    }

    /// The separate queue of a deferred bundle.
    pub fn queue(&self) -> Option<QueueHandle> {
        match self.submission {
            Submission::Immediate => None,
            Submission::Deferred { queue } => Some(queue),
        }
    }

    /// Total commands appended over the bundle's life.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Records `command`. Immediate bundles dispatch it right away.
    pub fn append(&mut self, command: &Command) -> Result<(), BundleError> {
        let driver = self.context.driver();

        if self.state == BundleState::Submitted {
            return Err(BundleError::InFlight);
        }
        if let Submission::Deferred { .. } = self.submission {
            match self.state {
                BundleState::Closed => return Err(BundleError::ListClosed),
                BundleState::Idle => {
                    driver.reset_command_list(self.list)?;
                    debug!("Reset list {:#x} for reuse", self.list.raw());
                }
                BundleState::Created | BundleState::Appending | BundleState::Submitted => {}
            }
        }

        driver.append(self.list, command)?;
        self.state = BundleState::Appending;
        self.appended += 1;
        Ok(())
    }

    /// Appends an ordinary launch of `kernel`.
    pub fn launch(&mut self, kernel: &Kernel<'_>, groups: GroupCount) -> Result<(), BundleError> {
        self.append(&Command::LaunchKernel {
            kernel: kernel.handle(),
            groups,
        })
    }

    /// Appends a cooperative launch of `kernel`; every group will be resident at once.
    pub fn launch_cooperative(
        &mut self,
        kernel: &Kernel<'_>,
        groups: GroupCount,
    ) -> Result<(), BundleError> {
        self.append(&Command::LaunchCooperativeKernel {
            kernel: kernel.handle(),
            groups,
        })
    }

    pub fn barrier(&mut self) -> Result<(), BundleError> {
        self.append(&Command::Barrier)
    }

    /// Closes a deferred list. Rejected on immediate bundles and on lists
    /// that are already closed.
    pub fn close(&mut self) -> Result<(), BundleError> {
        match (self.submission, self.state) {
            (Submission::Immediate, _) => Err(BundleError::CloseOnImmediate),
            (
                Submission::Deferred { .. },
                BundleState::Closed | BundleState::Submitted | BundleState::Idle,
            ) => {
                Err(BundleError::AlreadyClosed)
            }
            (Submission::Deferred { .. }, BundleState::Created | BundleState::Appending) => {
                self.context.driver().close_command_list(self.list)?;
                self.state = BundleState::Closed;
                Ok(())
            }
        }
    }

    /// Submits recorded work (deferred) and blocks until the device finished
    /// it or `timeout` elapsed.
    ///
    /// A deferred list that is still open is closed first. After a timeout
    /// the bundle stays `Submitted`: appends are rejected and calling this
    /// again only waits.
    pub fn submit_and_wait(&mut self, timeout: Timeout) -> Result<(), BundleError> {
        let driver = self.context.driver();

        let waited = match self.submission {
            Submission::Immediate => driver.synchronize_list_host(self.list, timeout),
            Submission::Deferred { queue } => {
                if matches!(self.state, BundleState::Created | BundleState::Appending) {
                    self.close()?;
                }
                if self.state == BundleState::Closed {
                    driver.execute_command_lists(queue, &[self.list])?;
                    self.state = BundleState::Submitted;
                }
                driver.synchronize_queue(queue, timeout)
            }
        };

        match waited {
            Ok(()) => {
                self.state = BundleState::Idle;
                Ok(())
            }
            Err(e) => {
                if e == DriverError::NotReady {
                    self.state = BundleState::Submitted;
                }
                Err(sync_error(e, timeout))
            }
        }
    }

    /// Releases the list, then the queue. Consumes the bundle.
    pub fn destroy(mut self) -> Result<(), BundleError> {
        self.released = true;
        self.release().map_err(BundleError::from)
    }

    fn release(&self) -> Result<(), DriverError> {
        let driver = self.context.driver();
        let list_result = driver.destroy_command_list(self.list);
        let queue_result = match self.submission {
            Submission::Immediate => Ok(()),
            Submission::Deferred { queue } => driver.destroy_command_queue(queue),
        };
        list_result.and(queue_result)
    }
}

impl Drop for CommandBundle<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.release() {
                warn!("Failed to release command bundle: {}", e);
            }
        }
    }
}

fn sync_error(err: DriverError, timeout: Timeout) -> BundleError {
    match err {
        DriverError::NotReady => BundleError::Timeout(timeout),
        other => BundleError::Driver(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceHandle, GroupSize};
    use crate::harness::{ADD_KERNEL, ADD_MODULE};
    use crate::kernel::{Module, ModuleLocator};
    use crate::memory::SharedBuffer;
    use crate::reference::{DeviceModel, ReferenceDriver};
    use crate::runtime::Runtime;
    use std::sync::Arc;
    use std::time::Duration;

    const LEN: usize = 256;

    fn setup(model: DeviceModel) -> (Runtime, DeviceHandle) {
        let runtime = Runtime::init(Arc::new(ReferenceDriver::new(vec![model]))).unwrap();
        let device = runtime.default_device().unwrap();
        (runtime, device)
    }

    /// Runs `launches` rounds of a += b over ones and returns `a`.
    fn add_rounds(mode: ExecutionMode, launches: usize) -> Vec<u8> {
        let (runtime, device) = setup(DeviceModel::default());
        let context = runtime.create_context().unwrap();
        let source = ModuleLocator::builtin().source(ADD_MODULE).unwrap();
        let module = Module::create(&context, device, &source).unwrap();
        let mut kernel = module.kernel(ADD_KERNEL).unwrap();
        kernel.set_group_size(GroupSize::new(16, 1, 1)).unwrap();

        let a = SharedBuffer::allocate(&context, device, LEN, 8).unwrap();
        let b = SharedBuffer::allocate(&context, device, LEN, 8).unwrap();
        a.fill(1).unwrap();
        b.fill(1).unwrap();
        kernel.set_buffer_arg(0, &a).unwrap();
        kernel.set_buffer_arg(1, &b).unwrap();

        let mut bundle = CommandBundle::create(&context, device, &BundleDesc::new(0, mode)).unwrap();
        for _ in 0..launches {
            bundle
                .launch(&kernel, GroupCount::new((LEN / 16) as u32, 1, 1))
                .unwrap();
            bundle.submit_and_wait(Timeout::Infinite).unwrap();
            assert_eq!(bundle.state(), BundleState::Idle);
        }
        bundle.destroy().unwrap();

        a.read::<u8>(LEN).unwrap()
    }

    #[test]
    fn test_modes_produce_identical_results() {
        let immediate = add_rounds(ExecutionMode::Immediate, 1);
        let deferred = add_rounds(ExecutionMode::Deferred, 1);
        assert!(immediate.iter().all(|&v| v == 2));
        assert_eq!(immediate, deferred);
    }

    #[test]
    fn test_deferred_bundle_is_reusable() {
        let out = add_rounds(ExecutionMode::Deferred, 3);
        assert!(out.iter().all(|&v| v == 4));
    }

    #[test]
    fn test_immediate_bundle_is_reusable() {
        let out = add_rounds(ExecutionMode::Immediate, 2);
        assert!(out.iter().all(|&v| v == 3));
    }

    #[test]
    fn test_close_on_immediate_is_rejected() {
        let (runtime, device) = setup(DeviceModel::default());
        let context = runtime.create_context().unwrap();
        let mut bundle =
            CommandBundle::create(&context, device, &BundleDesc::new(0, ExecutionMode::Immediate))
                .unwrap();
        assert!(bundle.queue().is_none());
        assert_eq!(bundle.close(), Err(BundleError::CloseOnImmediate));
    }

    #[test]
    fn test_deferred_close_rules() {
        let (runtime, device) = setup(DeviceModel::default());
        let context = runtime.create_context().unwrap();
        let mut bundle =
            CommandBundle::create(&context, device, &BundleDesc::new(0, ExecutionMode::Deferred))
                .unwrap();
        assert!(bundle.queue().is_some());

        bundle.barrier().unwrap();
        bundle.close().unwrap();
        assert_eq!(bundle.close(), Err(BundleError::AlreadyClosed));
        assert_eq!(bundle.barrier(), Err(BundleError::ListClosed));

        bundle
            .submit_and_wait(Timeout::After(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(bundle.state(), BundleState::Idle);
        assert_eq!(bundle.appended(), 1);
    }

    #[test]
    fn test_timeout_is_distinct_from_driver_failure() {
        let model = DeviceModel {
            dispatch_latency_us: 300_000,
            ..DeviceModel::default()
        };
        let (runtime, device) = setup(model);
        let context = runtime.create_context().unwrap();

        for mode in [ExecutionMode::Immediate, ExecutionMode::Deferred] {
            let mut bundle =
                CommandBundle::create(&context, device, &BundleDesc::new(0, mode)).unwrap();
            bundle.barrier().unwrap();

            let short = Timeout::After(Duration::from_millis(1));
            assert_eq!(bundle.submit_and_wait(short), Err(BundleError::Timeout(short)));

            // Work is still in flight; a second call only waits.
            bundle.submit_and_wait(Timeout::Infinite).unwrap();
            bundle.destroy().unwrap();
        }
    }

    #[test]
    fn test_append_rejected_while_in_flight() {
        let model = DeviceModel {
            dispatch_latency_us: 300_000,
            ..DeviceModel::default()
        };
        let (runtime, device) = setup(model);
        let context = runtime.create_context().unwrap();

        for mode in [ExecutionMode::Immediate, ExecutionMode::Deferred] {
            let mut bundle =
                CommandBundle::create(&context, device, &BundleDesc::new(0, mode)).unwrap();
            bundle.barrier().unwrap();

            let short = Timeout::After(Duration::from_millis(1));
            assert_eq!(bundle.submit_and_wait(short), Err(BundleError::Timeout(short)));
            assert_eq!(bundle.state(), BundleState::Submitted, "{}", mode);
            assert_eq!(bundle.barrier(), Err(BundleError::InFlight), "{}", mode);
            if mode == ExecutionMode::Deferred {
                assert_eq!(bundle.close(), Err(BundleError::AlreadyClosed));
            }

            bundle.submit_and_wait(Timeout::Infinite).unwrap();
            assert_eq!(bundle.state(), BundleState::Idle);
            bundle.barrier().unwrap();
            bundle.submit_and_wait(Timeout::Infinite).unwrap();
            assert_eq!(bundle.appended(), 2);
            bundle.destroy().unwrap();
        }
    }

    #[test]
    fn test_immediate_dispatches_at_append_deferred_waits_for_submit() {
        let (runtime, device) = setup(DeviceModel::default());
        let context = runtime.create_context().unwrap();

        // Deferred: recorded only.
        let buffer = SharedBuffer::allocate(&context, device, LEN, 8).unwrap();
        buffer.fill(0).unwrap();
        let mut deferred =
            CommandBundle::create(&context, device, &BundleDesc::new(0, ExecutionMode::Deferred))
                .unwrap();
        deferred
            .append(&Command::MemoryFill {
                dst: buffer.ptr(),
                pattern: vec![0xAB],
                size: LEN,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(buffer.read::<u8>(LEN).unwrap().iter().all(|&v| v == 0));
        deferred.submit_and_wait(Timeout::Infinite).unwrap();
        assert!(buffer.read::<u8>(LEN).unwrap().iter().all(|&v| v == 0xAB));
        deferred.destroy().unwrap();

        // Immediate: runs without any wait call.
        let other = SharedBuffer::allocate(&context, device, LEN, 8).unwrap();
        other.fill(0).unwrap();
        let mut immediate =
            CommandBundle::create(&context, device, &BundleDesc::new(0, ExecutionMode::Immediate))
                .unwrap();
        immediate
            .append(&Command::MemoryFill {
                dst: other.ptr(),
                pattern: vec![0xCD],
                size: LEN,
            })
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if other.read::<u8>(LEN).unwrap().iter().all(|&v| v == 0xCD) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "immediate fill never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
        immediate.destroy().unwrap();
    }

    #[test]
    fn test_missing_ordinal_fails_creation() {
        let (runtime, device) = setup(DeviceModel::default());
        let context = runtime.create_context().unwrap();
        for mode in [ExecutionMode::Immediate, ExecutionMode::Deferred] {
            let result = CommandBundle::create(&context, device, &BundleDesc::new(42, mode));
            assert!(matches!(
                result,
                Err(BundleError::Driver(DriverError::InvalidArgument(_)))
            ));
        }
    }

    #[test]
    fn test_rejected_queue_flags() {
        let (runtime, device) = setup(DeviceModel::default());
        let context = runtime.create_context().unwrap();
        let desc = BundleDesc {
            flags: QueueFlags::from_bits_retain(1 << 7),
            ..BundleDesc::new(0, ExecutionMode::Deferred)
        };
        assert!(matches!(
            CommandBundle::create(&context, device, &desc),
            Err(BundleError::Driver(DriverError::InvalidEnumeration(_)))
        ));
    }

    #[test]
    fn test_flag_decoding() {
        assert_eq!(ExecutionMode::from_flag(0), ExecutionMode::Deferred);
        assert_eq!(ExecutionMode::from_flag(1), ExecutionMode::Immediate);
        assert_eq!(ExecutionMode::from_flag(-3), ExecutionMode::Immediate);
        assert_eq!(ExecutionMode::from_flag(ExecutionMode::Deferred.flag()), ExecutionMode::Deferred);
    }
}
