//! One participant's distributed context.
//!
//! All per-process state (notify buffers, message queues, the object table)
//! lives in a [`DddContext`]; nothing is global, so several contexts can run
//! side by side in one address space, e.g. one per thread over
//! [`LocalComm`](crate::algs::communicator::LocalComm).

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::algs::communicator::Communicator;
use crate::algs::consistency::{ConsCheckMsg, ConsistencyChecker, ConsistencyReport};
use crate::algs::lowcomm::{MsgHandle, MsgTypeId, Transport};
use crate::algs::notify::{Notify, NotifyDesc};
use crate::algs::tree::TreeComm;
use crate::config::DddConfig;
use crate::ddd_error::DddError;
use crate::objects::ObjectTable;

pub struct DddContext<C: Communicator> {
    comm: C,
    config: DddConfig,
    notify: Notify,
    transport: Transport<C>,
    objects: ObjectTable,
    cons_msg: ConsCheckMsg,
}

impl<C: Communicator> DddContext<C> {
    /// Build a context; every process must pass an equivalent `config`.
    pub fn new(comm: C, config: DddConfig) -> Result<Self, DddError> {
        config.validate()?;
        let objects = ObjectTable::new(comm.rank())?;
        let mut transport = Transport::from_config(&config);
        let cons_msg = ConsCheckMsg::declare(&mut transport)?;
        let notify = Notify::new(config.tree_degree, config.notify_max_infos);
        log::debug!(
            "ddd[{}/{}]: context up (degree {})",
            comm.rank(),
            comm.size(),
            config.tree_degree
        );
        Ok(Self {
            comm,
            config,
            notify,
            transport,
            objects,
            cons_msg,
        })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn config(&self) -> &DddConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport<C> {
        &self.transport
    }

    /// Type declarations and per-message setup go through here.
    pub fn transport_mut(&mut self) -> &mut Transport<C> {
        &mut self.transport
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectTable {
        &mut self.objects
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.transport.cancel_flag()
    }

    // --- notify -------------------------------------------------------------

    /// One notify round: declare `sends`, get back the `(source, size)` pairs addressed here.
    pub fn notify(&mut self, sends: &[NotifyDesc]) -> Result<Vec<NotifyDesc>, DddError> {
        self.notify.begin(sends.len()).copy_from_slice(sends);
        let res = self.notify.notify_with(&self.comm, &self.transport.poll_guard());
        let received = self.notify.received().to_vec();
        self.notify.end();
        res.map(|_| received)
    }

    /// Join a notify round only to abort it everywhere with `code`.
    pub fn notify_abort(&mut self, code: u32) -> Result<usize, DddError> {
        self.notify.begin(0);
        self.notify.raise(code);
        let res = self.notify.notify_with(&self.comm, &self.transport.poll_guard());
        self.notify.end();
        res
    }

    // --- transport round ----------------------------------------------------

    pub fn connect(&mut self, t: MsgTypeId) -> Result<usize, DddError> {
        self.transport.connect(&self.comm, &mut self.notify, t)
    }

    pub fn connect_abort(&mut self, code: u32) -> Result<usize, DddError> {
        self.transport.connect_abort(&self.comm, &mut self.notify, code)
    }

    pub fn send(&mut self, h: MsgHandle) -> Result<(), DddError> {
        self.transport.send(&self.comm, h)
    }

    pub fn communicate(&mut self) -> Result<Vec<MsgHandle>, DddError> {
        self.transport.communicate()
    }

    pub fn cleanup(&mut self) {
        self.transport.cleanup();
    }

    // --- global operations --------------------------------------------------

    pub fn global_sum(&self, value: i64) -> Result<i64, DddError> {
        TreeComm::new(&self.comm, self.config.tree_degree)
            .with_guard(self.transport.poll_guard())
            .global_sum(value)
    }

    /// Collective. Global number of coupling mismatches.
    pub fn check_consistency(&mut self) -> Result<usize, DddError> {
        Ok(self.check_consistency_report()?.total_errors)
    }

    pub fn check_consistency_report(&mut self) -> Result<ConsistencyReport, DddError> {
        ConsistencyChecker::new(
            &self.comm,
            &mut self.notify,
            &mut self.transport,
            &self.objects,
            self.cons_msg,
        )
        .tree_degree(self.config.tree_degree)
        .strict(self.config.strict_consistency)
        .run_report()
    }
}

impl<C: Communicator + std::fmt::Debug> std::fmt::Debug for DddContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DddContext")
            .field("comm", &self.comm)
            .field("config", &self.config)
            .field("sends", &self.transport.n_sends())
            .field("recvs", &self.transport.n_recvs())
            .field("objects", &self.objects.len())
            .finish()
    }
}
