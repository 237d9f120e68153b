// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process fabric: participants are threads over shared exchange cells.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::trace;

use super::{Fabric, FabricError, RecvSide, SendSide, pack_elements, unpack_elements};

/// Shared-memory fabric for a fixed-size group of participant threads.
///
/// `alltoallv` packs each peer's elements into a byte stream, deposits the
/// streams into a cell matrix, meets the group at a barrier, then drains and
/// unpacks the incoming streams. A second barrier delays completion until
/// every participant has drained, so cells can be reused by the next call.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    gate: Mutex<Gate>,
    arrivals: Condvar,
    /// Flattened `world_size * world_size` matrix; `[src * world + dst]`.
    cells: Mutex<Vec<Option<Vec<u8>>>>,
}

#[derive(Debug, Default)]
struct Gate {
    arrived: usize,
    generation: u64,
    aborted_by: Option<usize>,
}

impl LocalFabric {
    pub fn new(world_size: usize) -> Self {
        assert!(world_size > 0, "a group needs at least one participant");
        Self {
            shared: Arc::new(Shared {
                world_size,
                gate: Mutex::new(Gate::default()),
                arrivals: Condvar::new(),
                cells: Mutex::new(vec![None; world_size * world_size]),
            }),
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, FabricError> {
        mutex.lock().map_err(|_| FabricError::Poisoned)
    }

    fn deposit(&self, src: usize, dst: usize, stream: Vec<u8>) -> Result<(), FabricError> {
        let mut cells = self.lock(&self.shared.cells)?;
        cells[src * self.shared.world_size + dst] = Some(stream);
        Ok(())
    }

    fn drain(&self, src: usize, dst: usize) -> Result<Vec<u8>, FabricError> {
        let mut cells = self.lock(&self.shared.cells)?;
        cells[src * self.shared.world_size + dst]
            .take()
            .ok_or(FabricError::MissingStream { peer: src })
    }

    fn fail<T>(&self, rank: usize, err: FabricError) -> Result<T, FabricError> {
        self.abort(rank);
        Err(err)
    }
}

impl Fabric for LocalFabric {
    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self, _rank: usize) -> Result<(), FabricError> {
        let mut gate = self.lock(&self.shared.gate)?;
        if let Some(rank) = gate.aborted_by {
            return Err(FabricError::Aborted { rank });
        }
        gate.arrived += 1;
        if gate.arrived == self.shared.world_size {
            gate.arrived = 0;
            gate.generation = gate.generation.wrapping_add(1);
            self.shared.arrivals.notify_all();
            return Ok(());
        }
        let generation = gate.generation;
        while gate.generation == generation && gate.aborted_by.is_none() {
            gate = self
                .shared
                .arrivals
                .wait(gate)
                .map_err(|_| FabricError::Poisoned)?;
        }
        match gate.aborted_by {
            Some(rank) => Err(FabricError::Aborted { rank }),
            None => Ok(()),
        }
    }

    fn abort(&self, rank: usize) {
        if let Ok(mut gate) = self.shared.gate.lock() {
            gate.aborted_by.get_or_insert(rank);
            self.shared.arrivals.notify_all();
        }
    }

    fn alltoallv(
        &self,
        rank: usize,
        send: SendSide<'_>,
        recv: RecvSide<'_>,
    ) -> Result<(), FabricError> {
        let world = self.shared.world_size;

        for peer in 0..world {
            let mut stream = Vec::with_capacity(send.counts[peer] * send.layout.byte_size());
            if let Err(err) = pack_elements(
                send.payload,
                send.origin,
                send.layout,
                send.displs[peer],
                send.counts[peer],
                &mut stream,
            ) {
                return self.fail(rank, err);
            }
            trace!(rank, peer, bytes = stream.len(), "deposited stream");
            self.deposit(rank, peer, stream)?;
        }

        self.barrier(rank)?;

        for peer in 0..world {
            let stream = match self.drain(peer, rank) {
                Ok(stream) => stream,
                Err(err) => return self.fail(rank, err),
            };
            let want = recv.counts[peer] * recv.layout.byte_size();
            if stream.len() != want {
                return self.fail(
                    rank,
                    FabricError::StreamSizeMismatch {
                        peer,
                        got: stream.len(),
                        want,
                    },
                );
            }
            if let Err(err) = unpack_elements(
                recv.payload,
                recv.origin,
                recv.layout,
                recv.displs[peer],
                recv.counts[peer],
                &stream,
            ) {
                return self.fail(rank, err);
            }
        }

        // Hold completion until every participant drained its cells.
        self.barrier(rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Layout, ScalarKind};
    use std::thread;

    #[test]
    fn barrier_releases_whole_group() {
        let fabric = LocalFabric::new(3);
        let done = Mutex::new(0usize);
        thread::scope(|s| {
            for rank in 0..3 {
                let fabric = &fabric;
                let done = &done;
                s.spawn(move || {
                    fabric.barrier(rank).unwrap();
                    *done.lock().unwrap() += 1;
                });
            }
        });
        assert_eq!(*done.lock().unwrap(), 3);
    }

    #[test]
    fn abort_unblocks_parked_participants() {
        let fabric = LocalFabric::new(2);
        thread::scope(|s| {
            let waiter = {
                let fabric = fabric.clone();
                s.spawn(move || fabric.barrier(0))
            };
            let fabric = fabric.clone();
            s.spawn(move || fabric.abort(1));
            let result = waiter.join().unwrap();
            assert!(matches!(result, Err(FabricError::Aborted { rank: 1 })));
        });
    }

    #[test]
    fn barrier_after_abort_fails_immediately() {
        let fabric = LocalFabric::new(2);
        fabric.abort(0);
        assert!(matches!(
            fabric.barrier(1),
            Err(FabricError::Aborted { rank: 0 })
        ));
    }

    #[test]
    fn scalar_alltoallv_moves_every_stream() {
        let world = 3;
        let fabric = LocalFabric::new(world);
        let layout = Layout::scalar(ScalarKind::U8).commit().unwrap();
        thread::scope(|s| {
            for rank in 0..world {
                let fabric = fabric.clone();
                let layout = layout.clone();
                s.spawn(move || {
                    // Two bytes per peer; value encodes (sender, peer, index).
                    let send_payload: Vec<u8> = (0..world * 2)
                        .map(|i| (rank * 10 + i) as u8)
                        .collect();
                    let counts = vec![2usize; world];
                    let displs: Vec<usize> = (0..world).map(|p| 2 * p).collect();
                    let mut recv_payload = vec![0u8; world * 2];
                    fabric
                        .alltoallv(
                            rank,
                            SendSide {
                                payload: &send_payload,
                                origin: 0,
                                counts: &counts,
                                displs: &displs,
                                layout: &layout,
                            },
                            RecvSide {
                                payload: &mut recv_payload,
                                origin: 0,
                                counts: &counts,
                                displs: &displs,
                                layout: &layout,
                            },
                        )
                        .unwrap();
                    for peer in 0..world {
                        // Peer sent us its segment for `rank`.
                        let want = [
                            (peer * 10 + rank * 2) as u8,
                            (peer * 10 + rank * 2 + 1) as u8,
                        ];
                        assert_eq!(&recv_payload[2 * peer..2 * peer + 2], &want);
                    }
                });
            }
        });
    }

    #[test]
    fn mismatched_stream_size_aborts_group() {
        let world = 2;
        let fabric = LocalFabric::new(world);
        let layout = Layout::scalar(ScalarKind::U8).commit().unwrap();
        thread::scope(|s| {
            let mut handles = Vec::new();
            for rank in 0..world {
                let fabric = fabric.clone();
                let layout = layout.clone();
                handles.push(s.spawn(move || {
                    let send_payload = vec![0u8; 2];
                    // Rank 0 claims one element per peer, rank 1 claims two:
                    // the receive side can never agree with the stream.
                    let send_counts = vec![1usize; world];
                    let recv_counts = vec![rank + 1; world];
                    let displs = vec![0usize, 1];
                    let recv_displs: Vec<usize> =
                        (0..world).map(|p| p * (rank + 1)).collect();
                    let mut recv_payload = vec![0u8; world * (rank + 1)];
                    fabric.alltoallv(
                        rank,
                        SendSide {
                            payload: &send_payload,
                            origin: 0,
                            counts: &send_counts,
                            displs: &displs,
                            layout: &layout,
                        },
                        RecvSide {
                            payload: &mut recv_payload,
                            origin: 0,
                            counts: &recv_counts,
                            displs: &recv_displs,
                            layout: &layout,
                        },
                    )
                }));
            }
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(results.iter().any(|r| {
                matches!(
                    r,
                    Err(FabricError::StreamSizeMismatch { .. }) | Err(FabricError::Aborted { .. })
                )
            }));
        });
    }
}
