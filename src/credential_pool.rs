/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A bounded pool of single-use signing credentials, shared between the threads of a [`Stack`]
//! implementation.
//!
//! Stacks that sign every message with a fresh credential (for example a one-time transaction
//! certificate) fill the pool from a background thread with [`add`](CredentialPool::add), and take
//! a credential for every signature with [`next`](CredentialPool::next). A taker waits a bounded time
//! for the pool to be refilled, and gets an explicit [`CredentialPoolError::Exhausted`] error if it
//! never is.
//!
//! [`Stack`]: crate::stack::Stack

use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    sync::{Condvar, Mutex},
    time::Duration,
};

/// Number of bounded waits [`CredentialPool::next`] makes before giving up.
pub const NEXT_ATTEMPTS: u32 = 3;

/// # Locking
///
/// The pool's lock is only held while credentials are added or removed. A taker waiting in
/// [`next`](Self::next) releases it for the whole wait, so a waiting taker never blocks
/// [`add`](Self::add), [`drain`](Self::drain), or other takers.
pub struct CredentialPool<C> {
    capacity: usize,
    credentials: Mutex<VecDeque<C>>,
    added: Condvar,
}

impl<C: Send> CredentialPool<C> {
    /// Create an empty pool that holds at most `capacity` credentials.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            credentials: Mutex::new(VecDeque::with_capacity(capacity)),
            added: Condvar::new(),
        }
    }

    /// Add a credential to the pool without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialPoolError::Full`] if the pool is at capacity.
    pub fn add(&self, credential: C) -> Result<(), CredentialPoolError> {
        let mut credentials = self
            .credentials
            .lock()
            .map_err(|_| CredentialPoolError::Poisoned)?;
        if credentials.len() >= self.capacity {
            return Err(CredentialPoolError::Full);
        }
        credentials.push_back(credential);
        self.added.notify_one();
        Ok(())
    }

    /// Take the next credential, waiting up to `attempt_timeout` for one to be added, up to
    /// [`NEXT_ATTEMPTS`] times.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialPoolError::Exhausted`] if the pool stayed empty through every attempt.
    pub fn next(&self, attempt_timeout: Duration) -> Result<C, CredentialPoolError> {
        let mut credentials = self
            .credentials
            .lock()
            .map_err(|_| CredentialPoolError::Poisoned)?;
        for attempt in 1..=NEXT_ATTEMPTS {
            if let Some(credential) = credentials.pop_front() {
                return Ok(credential);
            }
            log::debug!("getting next credential, attempt {} of {}", attempt, NEXT_ATTEMPTS);
            let (guard, wait) = self
                .added
                .wait_timeout_while(credentials, attempt_timeout, |credentials| credentials.is_empty())
                .map_err(|_| CredentialPoolError::Poisoned)?;
            credentials = guard;
            if wait.timed_out() {
                log::warn!("no credential was added within {:?}", attempt_timeout)
            }
        }
        credentials.pop_front().ok_or(CredentialPoolError::Exhausted {
            attempts: NEXT_ATTEMPTS,
        })
    }

    /// Remove and return every credential left in the pool, for example to store them on shutdown.
    pub fn drain(&self) -> Vec<C> {
        let unused: Vec<C> = match self.credentials.lock() {
            Ok(mut credentials) => credentials.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        log::debug!("drained {} unused credentials", unused.len());
        unused
    }
}

/// Enumerates the ways adding to or taking from a [`CredentialPool`] can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPoolError {
    /// The pool is at capacity.
    Full,

    /// The pool stayed empty through `attempts` bounded waits.
    Exhausted { attempts: u32 },

    /// A thread panicked while holding the pool's lock.
    Poisoned,
}

impl Display for CredentialPoolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CredentialPoolError::Full => write!(f, "credential pool is full"),
            CredentialPoolError::Exhausted { attempts } => {
                write!(f, "credential pool stayed empty through {} attempts", attempts)
            }
            CredentialPoolError::Poisoned => write!(f, "credential pool is poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn credentials_are_taken_in_order_added() {
        let pool = CredentialPool::new(2);
        pool.add(1).unwrap();
        pool.add(2).unwrap();
        assert_eq!(pool.add(3), Err(CredentialPoolError::Full));

        assert_eq!(pool.next(Duration::from_millis(10)), Ok(1));
        assert_eq!(pool.drain(), vec![2]);
        assert!(pool.drain().is_empty());
    }

    #[test]
    fn empty_pool_is_an_error_not_an_absent_value() {
        let pool: CredentialPool<u8> = CredentialPool::new(1);
        assert_eq!(
            pool.next(Duration::from_millis(5)),
            Err(CredentialPoolError::Exhausted {
                attempts: NEXT_ATTEMPTS
            })
        );
    }

    #[test]
    fn taker_waits_for_a_filler_thread() {
        let pool = Arc::new(CredentialPool::new(1));
        let filler = {
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pool.add("credential").unwrap();
            })
        };
        assert_eq!(pool.next(Duration::from_secs(5)), Ok("credential"));
        filler.join().unwrap();
    }

    #[test]
    fn waiting_taker_does_not_hold_the_pool() {
        let pool = Arc::new(CredentialPool::new(2));
        let taker = {
            let pool = pool.clone();
            thread::spawn(move || pool.next(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));

        // The taker is waiting on an empty pool. Draining and adding still go through immediately.
        let started = Instant::now();
        assert!(pool.drain().is_empty());
        pool.add(7).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(taker.join().unwrap(), Ok(7));
        assert!(pool.drain().is_empty());
    }
}
