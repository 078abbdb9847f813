//! Building and posting collectives on a [`TeamContext`].
//!
//! Every factory validates its arguments, resolves the single device the
//! buffers live on, orders device-resident work after the caller's compute
//! stream, then initializes and posts one library collective. The returned
//! request is already `InProgress`.

use std::sync::Arc;

use crate::context::TeamContext;
use crate::device::{PooledEvent, StreamId};
use crate::error::{Result, XcollError};
use crate::library::{CollArgs, CollBuffers, CollectiveLibrary, ReduceInfo};
use crate::memory::Tensor;
use crate::reduce::is_reducible;
use crate::request::{CollRequest, Posted, RequestKind};
use crate::types::{CollectiveType, Device, MemoryKind, Rank, ReduceOp};

/// The one device all `tensors` live on.
fn common_device<'a>(tensors: impl IntoIterator<Item = &'a Tensor>) -> Result<Device> {
    let mut iter = tensors.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| XcollError::InvalidArgument("no buffers given".into()))?
        .device();
    for t in iter {
        if t.device() != first {
            return Err(XcollError::DeviceMismatch {
                first,
                second: t.device(),
            });
        }
    }
    Ok(first)
}

fn single<'a>(tensors: &'a [Tensor], coll: CollectiveType) -> Result<&'a Tensor> {
    match tensors {
        [t] => Ok(t),
        _ => Err(XcollError::InvalidArgument(format!(
            "{coll} takes exactly one tensor, got {}",
            tensors.len()
        ))),
    }
}

struct Plan {
    coll_type: CollectiveType,
    device: Device,
    buffers: CollBuffers,
    root: Rank,
    reduce: Option<ReduceInfo>,
    src: Vec<Tensor>,
    dst: Vec<Tensor>,
    kind: RequestKind,
}

impl Plan {
    fn new(coll_type: CollectiveType, device: Device, buffers: CollBuffers) -> Self {
        Self {
            coll_type,
            device,
            buffers,
            root: 0,
            reduce: None,
            src: Vec::new(),
            dst: Vec::new(),
            kind: RequestKind::Plain,
        }
    }
}

impl<L: CollectiveLibrary> TeamContext<L> {
    /// Gather `input` from every rank; `outputs[r]` receives rank `r`'s block.
    pub fn allgather(&self, input: &Tensor, outputs: &[Tensor]) -> Result<CollRequest<L>> {
        let coll = CollectiveType::Allgather;
        let device = common_device(std::iter::once(input).chain(outputs))?;
        let size = self.size() as usize;
        if outputs.len() != size {
            return Err(XcollError::InvalidArgument(format!(
                "{coll} needs {size} outputs, got {}",
                outputs.len()
            )));
        }
        let block = input.len_bytes()?;
        for out in outputs {
            if out.dtype() != input.dtype() {
                return Err(XcollError::InvalidArgument(format!(
                    "{coll} output is {}, input is {}",
                    out.dtype(),
                    input.dtype()
                )));
            }
            let actual = out.len_bytes()?;
            if actual != block {
                return Err(XcollError::BufferSizeMismatch {
                    expected: block,
                    actual,
                });
            }
        }
        let flat = Tensor::new_like_flat(outputs)?;
        let buffers = CollBuffers::Pair {
            src: input.clone(),
            dst: flat.clone(),
            len: block * size,
        };
        let mut plan = Plan::new(coll, device, buffers);
        plan.src = vec![input.clone()];
        plan.dst = outputs.to_vec();
        plan.kind = RequestKind::Allgather { flat };
        self.submit(plan)
    }

    /// Exchange equal blocks: block `r` of `input` goes to rank `r`, and
    /// block `r` of `output` comes from rank `r`.
    pub fn alltoall(&self, input: &Tensor, output: &Tensor) -> Result<CollRequest<L>> {
        let coll = CollectiveType::Alltoall;
        let device = common_device([input, output])?;
        let size = self.size() as usize;
        let total = input.len_bytes()?;
        if total % size != 0 {
            return Err(XcollError::IndivisibleCount {
                count: total,
                size,
                operation: coll,
            });
        }
        let out_len = output.len_bytes()?;
        if out_len != total {
            return Err(XcollError::BufferSizeMismatch {
                expected: total,
                actual: out_len,
            });
        }
        let buffers = CollBuffers::Pair {
            src: input.clone(),
            dst: output.clone(),
            len: total / size,
        };
        let mut plan = Plan::new(coll, device, buffers);
        plan.src = vec![input.clone()];
        plan.dst = vec![output.clone()];
        self.submit(plan)
    }

    /// Exchange variable blocks. Lengths and offsets are in elements, one
    /// entry per rank.
    pub fn alltoallv(
        &self,
        input: &Tensor,
        send_lengths: &[u32],
        send_offsets: &[u32],
        output: &Tensor,
        recv_lengths: &[u32],
        recv_offsets: &[u32],
    ) -> Result<CollRequest<L>> {
        let coll = CollectiveType::Alltoallv;
        let device = common_device([input, output])?;
        let size = self.size() as usize;
        for (name, v) in [
            ("send_lengths", send_lengths),
            ("send_offsets", send_offsets),
            ("recv_lengths", recv_lengths),
            ("recv_offsets", recv_offsets),
        ] {
            if v.len() != size {
                return Err(XcollError::InvalidArgument(format!(
                    "{coll} {name} has {} entries, group size is {size}",
                    v.len()
                )));
            }
        }
        let buffers = CollBuffers::Vector {
            src: input.clone(),
            src_counts: send_lengths.to_vec(),
            src_displs: send_offsets.to_vec(),
            dst: output.clone(),
            dst_counts: recv_lengths.to_vec(),
            dst_displs: recv_offsets.to_vec(),
        };
        let mut plan = Plan::new(coll, device, buffers);
        plan.src = vec![input.clone()];
        plan.dst = vec![output.clone()];
        self.submit(plan)
    }

    /// Reduce the single tensor in place across all ranks.
    pub fn allreduce(&self, tensors: &[Tensor], op: ReduceOp) -> Result<CollRequest<L>> {
        let coll = CollectiveType::Allreduce;
        let device = common_device(tensors)?;
        let tensor = single(tensors, coll)?;
        if !is_reducible(tensor.dtype()) {
            return Err(XcollError::UnsupportedDType {
                dtype: tensor.dtype(),
                op: "allreduce",
            });
        }
        let mut plan = Plan::new(coll, device, CollBuffers::InPlace(tensor.clone()));
        plan.reduce = Some(ReduceInfo {
            count: tensor.numel()?,
            dtype: tensor.dtype(),
            op,
        });
        plan.src = vec![tensor.clone()];
        self.submit(plan)
    }

    /// Synchronize all ranks.
    ///
    /// In device-barrier mode the barrier is ordered on the communication
    /// stream like any device collective, which must already exist.
    pub fn barrier(&self) -> Result<CollRequest<L>> {
        let coll = CollectiveType::Barrier;
        let device = if self.policy().gpu_barrier {
            match self.device_sync().comm_binding()? {
                Some((ordinal, _)) => Device::Cuda(ordinal),
                None => {
                    return Err(XcollError::Configuration(
                        "device barrier needs a communication stream; \
                         post a device collective first"
                            .into(),
                    ));
                }
            }
        } else {
            Device::Host
        };
        self.submit(Plan::new(coll, device, CollBuffers::None))
    }

    /// Broadcast the single tensor from `root` in place.
    pub fn broadcast(&self, tensors: &[Tensor], root: Rank) -> Result<CollRequest<L>> {
        let coll = CollectiveType::Broadcast;
        let device = common_device(tensors)?;
        let tensor = single(tensors, coll)?;
        if root >= self.size() {
            return Err(XcollError::InvalidRank {
                rank: root,
                size: self.size(),
            });
        }
        let mut plan = Plan::new(coll, device, CollBuffers::InPlace(tensor.clone()));
        plan.root = root;
        plan.src = vec![tensor.clone()];
        self.submit(plan)
    }

    fn order_device_work(&self, device: Device) -> Result<(Option<StreamId>, Option<PooledEvent>)> {
        let Some(ordinal) = device.ordinal() else {
            return Ok((None, None));
        };
        let sync = self.device_sync();
        let event = sync.order_after_compute(ordinal)?;
        Ok((sync.comm_stream()?, Some(event)))
    }

    fn submit(&self, plan: Plan) -> Result<CollRequest<L>> {
        let coll = plan.coll_type;
        let (stream, event) = self.order_device_work(plan.device)?;

        let mut args = CollArgs::new(coll, plan.buffers, MemoryKind::from(plan.device));
        args.root = plan.root;
        args.reduce = plan.reduce;
        args.stream = stream;

        let shared = &self.shared;
        let library = &shared.library;
        let mut handle = library
            .collective_init(args, shared.team()?)
            .map_err(|e| XcollError::Post {
                operation: coll,
                reason: format!("init: {e}"),
            })?;
        if let Err(e) = library.collective_post(&mut handle) {
            if let Err(fe) = library.collective_finalize(handle) {
                tracing::warn!(coll = %coll, error = %fe, "finalize after failed post failed");
            }
            return Err(XcollError::Post {
                operation: coll,
                reason: e.to_string(),
            });
        }
        tracing::debug!(rank = shared.rank, coll = %coll, device = %plan.device, "collective posted");

        let request = CollRequest::posted(
            Arc::clone(shared),
            Posted {
                device: plan.device,
                coll_type: coll,
                src: plan.src,
                dst: plan.dst,
                kind: plan.kind,
                handle,
                event,
            },
        );
        if plan.device.is_device()
            && !shared.policy.blocking_wait(coll)
            && let Some(ev) = request.pooled_event()
        {
            shared.sync.record_completion(ev)?;
        }
        Ok(request)
    }
}
