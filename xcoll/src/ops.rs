use crate::context::TeamContext;
use crate::error::Result;
use crate::library::CollectiveLibrary;
use crate::memory::Tensor;
use crate::request::{CollRequest, RequestStatus};
use crate::types::{Rank, ReduceOp};

/// Host-facing collective backend.
///
/// A process group drives every backend through this trait: post a
/// collective, then `progress` the returned request until `test` reports a
/// terminal status. Backends are created with their own constructor
/// (`TeamContext::init` for the library-backed one).
pub trait CollectiveOps {
    type Request;

    fn allgather(&self, input: &Tensor, outputs: &[Tensor]) -> Result<Self::Request>;

    fn alltoall(&self, input: &Tensor, output: &Tensor) -> Result<Self::Request>;

    #[allow(clippy::too_many_arguments)]
    fn alltoallv(
        &self,
        input: &Tensor,
        send_lengths: &[u32],
        send_offsets: &[u32],
        output: &Tensor,
        recv_lengths: &[u32],
        recv_offsets: &[u32],
    ) -> Result<Self::Request>;

    fn allreduce(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Self::Request>;

    fn barrier(&self) -> Result<Self::Request>;

    fn broadcast(&self, tensors: &[Tensor], root: Rank) -> Result<Self::Request>;

    fn progress(&self, request: &mut Self::Request) -> Result<()>;

    fn test(&self, request: &Self::Request) -> RequestStatus;

    fn fence(&self, request: &Self::Request) -> Result<()>;

    /// Release a request whether or not it finished.
    fn free(&self, request: Self::Request);

    fn close(self) -> Result<()>
    where
        Self: Sized;
}

impl<L: CollectiveLibrary> CollectiveOps for TeamContext<L> {
    type Request = CollRequest<L>;

    fn allgather(&self, input: &Tensor, outputs: &[Tensor]) -> Result<CollRequest<L>> {
        TeamContext::allgather(self, input, outputs)
    }

    fn alltoall(&self, input: &Tensor, output: &Tensor) -> Result<CollRequest<L>> {
        TeamContext::alltoall(self, input, output)
    }

    fn alltoallv(
        &self,
        input: &Tensor,
        send_lengths: &[u32],
        send_offsets: &[u32],
        output: &Tensor,
        recv_lengths: &[u32],
        recv_offsets: &[u32],
    ) -> Result<CollRequest<L>> {
        TeamContext::alltoallv(
            self,
            input,
            send_lengths,
            send_offsets,
            output,
            recv_lengths,
            recv_offsets,
        )
    }

    fn allreduce(&self, tensors: &[Tensor], op: ReduceOp) -> Result<CollRequest<L>> {
        TeamContext::allreduce(self, tensors, op)
    }

    fn barrier(&self) -> Result<CollRequest<L>> {
        TeamContext::barrier(self)
    }

    fn broadcast(&self, tensors: &[Tensor], root: Rank) -> Result<CollRequest<L>> {
        TeamContext::broadcast(self, tensors, root)
    }

    fn progress(&self, request: &mut CollRequest<L>) -> Result<()> {
        request.progress()
    }

    fn test(&self, request: &CollRequest<L>) -> RequestStatus {
        request.test()
    }

    fn fence(&self, request: &CollRequest<L>) -> Result<()> {
        request.fence()
    }

    fn free(&self, request: CollRequest<L>) {
        drop(request);
    }

    fn close(self) -> Result<()> {
        TeamContext::close(self)
    }
}
