//! Round-by-round progress engine.
//!
//! Each call drains the current round's in-flight operations from last to
//! first. A pending operation ends the call with [`Progress::Continue`].
//! Once the round is drained the continuation flag decides between
//! finishing and issuing the next round. Rounds after the first are drained
//! again in the same call, so cheap rounds complete without an extra poll.

use super::handle::{Handle, Plan, Progress, RequestState};
use super::try_get::TryGetOp;
use crate::datatype;
use crate::error::{Result, RmaCollError};
use crate::reduce;
use crate::schedule::{Instruction, RmaArgs, scan};
use crate::transport::RmaRequest;
use std::sync::Arc;
use std::task::Poll;

impl Handle {
    /// Advance the request as far as possible without blocking.
    ///
    /// Finished requests return `Done` on every call; failed requests
    /// return their stored error on every call. An inactive request has
    /// nothing to progress and reports `Done`.
    pub fn progress(&mut self) -> Result<Progress> {
        match &self.state {
            RequestState::Finished | RequestState::Inactive => return Ok(Progress::Done),
            RequestState::Failed(e) => return Err(e.clone()),
            RequestState::Active => {}
        }
        let ticked = match self.plan.as_mut() {
            Some(Plan::Triggers(graph)) => graph.tick().map(|_| graph.is_complete()),
            Some(Plan::Rounds(_)) => return self.progress_rounds(),
            None => Err(RmaCollError::invalid("active request without a plan")),
        };
        match ticked {
            Ok(true) => {
                self.finalize_finished();
                Ok(Progress::Done)
            }
            Ok(false) => Ok(Progress::Continue),
            Err(e) => Err(self.finalize_failed(e)),
        }
    }

    fn progress_rounds(&mut self) -> Result<Progress> {
        loop {
            while let Some(op) = self.in_flight.last_mut() {
                match op.poll_complete() {
                    Poll::Pending => return Ok(Progress::Continue),
                    Poll::Ready(Ok(())) => {
                        self.in_flight.pop();
                    }
                    Poll::Ready(Err(e)) => {
                        // Remaining operations of the round are abandoned.
                        return Err(self.finalize_failed(e));
                    }
                }
            }

            if let Some(e) = self.error.take() {
                return Err(self.finalize_failed(e));
            }

            let (more, size) = match self.scan_current_round() {
                Ok(v) => v,
                Err(e) => return Err(self.finalize_failed(e)),
            };
            if !more {
                self.finalize_finished();
                return Ok(Progress::Done);
            }

            self.round_offset += size + 1;
            self.round_index += 1;
            tracing::debug!(
                rank = self.comm.rank(),
                tag = self.tag,
                round = self.round_index,
                offset = self.round_offset,
                "advancing to next round"
            );
            // An issue error is recorded on the handle; what was issued still
            // drains on the next pass of the loop.
            let _ = self.start_round();
        }
    }

    fn scan_current_round(&self) -> Result<(bool, usize)> {
        let Some(Plan::Rounds(schedule)) = &self.plan else {
            return Err(RmaCollError::invalid("request has no schedule"));
        };
        let bytes = schedule.as_bytes();
        let size = scan::round_size(bytes, self.round_offset)?;
        let more = scan::continuation(bytes, self.round_offset)?;
        Ok((more, size))
    }

    /// Issue every record of the round at `round_offset`.
    ///
    /// Stops at the first record that fails to issue; the error is recorded
    /// on the handle and returned.
    pub(super) fn start_round(&mut self) -> Result<()> {
        let records = {
            let Some(Plan::Rounds(schedule)) = &self.plan else {
                return Err(RmaCollError::invalid("request has no schedule"));
            };
            scan::round_records(schedule.as_bytes(), self.round_offset)
        };
        let records = match records {
            Ok(r) => r,
            Err(e) => {
                self.error = Some(e.clone());
                return Err(e);
            }
        };
        tracing::debug!(
            rank = self.comm.rank(),
            tag = self.tag,
            round = self.round_index,
            records = records.len(),
            "round start"
        );
        for (offset, instr) in records {
            if let Err(e) = self.issue(instr) {
                tracing::warn!(
                    rank = self.comm.rank(),
                    tag = self.tag,
                    offset,
                    record = %instr,
                    error = %e,
                    "record failed to issue"
                );
                self.error = Some(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    fn issue(&mut self, instr: Instruction) -> Result<()> {
        tracing::trace!(rank = self.comm.rank(), record = %instr, "issue");
        match instr {
            Instruction::Put(a) => {
                let req = self.rma_request(&a)?;
                let op = unsafe { self.window()?.rput(&req)? };
                self.in_flight.push(op);
            }
            Instruction::Get(a) => {
                let req = self.rma_request(&a)?;
                let op = unsafe { self.window()?.rget(&req)? };
                self.in_flight.push(op);
            }
            Instruction::TryGet(a) => {
                let req = self.rma_request(&a.get)?;
                let window = Arc::clone(self.window()?);
                self.in_flight
                    .push(Box::new(TryGetOp::new(window, req, a.lock_type, a.assert)));
            }
            Instruction::WindowRelease => {
                let op = self.window()?.release()?;
                self.in_flight.push(op);
            }
            Instruction::Send(m) => {
                let ptr = self.resolve(m.buf, datatype::extent(m.dtype, m.count as usize))?;
                let op = unsafe {
                    self.comm
                        .transport()
                        .isend(ptr, m.count as usize, m.dtype, m.peer, self.tag)?
                };
                self.in_flight.push(op);
            }
            Instruction::Recv(m) => {
                let ptr = self.resolve(m.buf, datatype::extent(m.dtype, m.count as usize))?;
                let op = unsafe {
                    self.comm
                        .transport()
                        .irecv(ptr, m.count as usize, m.dtype, m.peer, self.tag)?
                };
                self.in_flight.push(op);
            }
            Instruction::Reduce(r) => {
                let bytes = datatype::extent(r.dtype, r.count as usize);
                let src = self.resolve(r.src, bytes)?;
                let dst = self.resolve(r.dst, bytes)?;
                unsafe { reduce::reduce_raw(dst, src, r.count as usize, r.dtype, r.op)? };
            }
            Instruction::Copy(c) => {
                let src = self.resolve(c.src, datatype::extent(c.src_dtype, c.src_count as usize))?;
                let dst = self.resolve(c.dst, datatype::extent(c.dst_dtype, c.dst_count as usize))?;
                unsafe {
                    datatype::copy_raw(
                        src,
                        c.src_count as usize,
                        c.src_dtype,
                        dst,
                        c.dst_count as usize,
                        c.dst_dtype,
                    )?
                };
            }
            Instruction::Unpack(u) => {
                let bytes = datatype::extent(u.dtype, u.count as usize);
                let src = self.resolve(u.src, bytes)?;
                let dst = self.resolve(u.dst, bytes)?;
                unsafe { datatype::unpack_external32_raw(src, u.count as usize, u.dtype, dst)? };
            }
        }
        Ok(())
    }

    fn rma_request(&mut self, a: &RmaArgs) -> Result<RmaRequest> {
        let origin = self.resolve(
            a.origin,
            datatype::extent(a.origin_dtype, a.origin_count as usize),
        )?;
        Ok(RmaRequest {
            origin,
            origin_count: a.origin_count as usize,
            origin_dtype: a.origin_dtype,
            target: a.target,
            target_disp: a.target_disp,
            target_count: a.target_count as usize,
            target_dtype: a.target_dtype,
        })
    }
}
