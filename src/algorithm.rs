/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The algorithm thread, which owns a [`Pbft`] and is the single consumer of its inputs.
//!
//! The thread:
//! 1. [Initializes](Pbft::initialize) the replica, blocking until the stack reports its membership.
//!    Inputs submitted in the meantime wait in the input channel.
//! 2. Loops until it is signalled to shut down:
//!     * Waits up to `tick_interval` for the next [`Input`], and [handles](Pbft::handle) it.
//!     * [Ticks](Pbft::tick) the replica, firing every deadline that has expired.
//! 3. [Closes](Pbft::close) the replica.
//!
//! A replica that halts keeps draining its inputs, refusing each of them, until it is shut down.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    adapter::{Input, Pbft, PbftError},
    stack::Stack,
};

pub(crate) struct Algorithm<S: Stack + 'static> {
    pbft: Pbft<S>,
    inputs: Receiver<Input>,
    shutdown_signal: Receiver<()>,
    tick_interval: Duration,
}

impl<S: Stack + 'static> Algorithm<S> {
    pub(crate) fn new(
        pbft: Pbft<S>,
        inputs: Receiver<Input>,
        shutdown_signal: Receiver<()>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            pbft,
            inputs,
            shutdown_signal,
            tick_interval,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(err) = self.pbft.initialize() {
                log::error!("failed to initialize replica: {}", err);
                return;
            }

            loop {
                match self.shutdown_signal.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => (),
                }

                match self.inputs.recv_timeout(self.tick_interval) {
                    Ok(input) => report(self.pbft.handle(input)),
                    Err(RecvTimeoutError::Timeout) => (),
                    // Every `Replica` handle is gone. Wait for the shutdown signal.
                    Err(RecvTimeoutError::Disconnected) => {
                        let _ = self.shutdown_signal.recv();
                        break;
                    }
                }

                report(self.pbft.tick(Instant::now()));
            }

            self.pbft.close();
        })
    }
}

fn report(result: Result<(), PbftError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_fatal() => log::error!("{}", err),
        Err(err) => log::debug!("{}", err),
    }
}
