use log::debug;
use std::error;
use std::sync::{Mutex, MutexGuard};

use crate::block::Block;
use crate::codestream::{Codestream, FlushOptions, Precinct, Subband, Tile};
use crate::geometry::Coords;
use crate::CodestreamError;

/// Number of locks reserved for application use.
pub const APP_LOCKS: u8 = 4;

/// Named locks shared by the threads of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockId {
    /// Held for every access to the shared codestream.
    General,
    /// Byte counts and rate control: flushing and transcoding.
    Stats,
    /// Completion checks made when blocks and precincts are returned.
    PrecinctCheck,
    /// Releasing tile and precinct storage.
    Allocator,
    /// The region of interest of the current view.
    Roi,
    App(u8),
}

impl LockId {
    fn slot(self) -> Result<usize, Box<dyn error::Error>> {
        Ok(match self {
            LockId::General => 0,
            LockId::Stats => 1,
            LockId::PrecinctCheck => 2,
            LockId::Allocator => 3,
            LockId::Roi => 4,
            LockId::App(index) if index < APP_LOCKS => 5 + index as usize,
            LockId::App(index) => return Err(CodestreamError::LockOutOfRange { index }.into()),
        })
    }
}

/// Shares one codestream between worker threads.
///
/// The operations below take the named lock of their concern first and
/// then the general lock, which guards the codestream itself. Block coding
/// runs in parallel on blocks the threads have checked out; checkout and
/// return are serialized.
///
/// Application code may take any named lock with [`ThreadEnv::lock`] to
/// exclude the matching library operations, for example holding
/// [`LockId::Stats`] while reading byte counts. A thread must not call an
/// operation which takes a lock it already holds.
pub struct ThreadEnv<'a> {
    codestream: Mutex<Codestream<'a>>,
    locks: Vec<Mutex<()>>,
}

fn recover<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|e| {
        debug!("recovering lock poisoned by a panicked thread");
        e.into_inner()
    })
}

impl<'a> ThreadEnv<'a> {
    pub fn new(codestream: Codestream<'a>) -> ThreadEnv<'a> {
        ThreadEnv {
            codestream: Mutex::new(codestream),
            locks: (0..5 + APP_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Takes one of the environment's named locks. A lock poisoned by a
    /// panicking thread is recovered.
    pub fn lock(&self, id: LockId) -> Result<MutexGuard<'_, ()>, Box<dyn error::Error>> {
        let slot = id.slot()?;
        Ok(recover(self.locks[slot].lock()))
    }

    /// Runs `f` with exclusive access to the codestream, under the general
    /// lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut Codestream<'a>) -> R) -> R {
        let _general = recover(self.locks[0].lock());
        let mut codestream = recover(self.codestream.lock());
        f(&mut codestream)
    }

    /// Like [`ThreadEnv::with`], holding the lock `id` as well.
    pub fn with_locked<R>(
        &self,
        id: LockId,
        f: impl FnOnce(&mut Codestream<'a>) -> Result<R, Box<dyn error::Error>>,
    ) -> Result<R, Box<dyn error::Error>> {
        if id == LockId::General {
            return self.with(f);
        }
        let _held = self.lock(id)?;
        self.with(f)
    }

    pub fn open_tile(&self, index: Coords) -> Result<Option<Tile>, Box<dyn error::Error>> {
        self.with(|codestream| codestream.open_tile(index))
    }

    pub fn close_tile(&self, tile: Tile) -> Result<(), Box<dyn error::Error>> {
        self.with_locked(LockId::Allocator, |codestream| codestream.close_tile(tile))
    }

    pub fn open_block(&self, band: Subband, index: Coords) -> Result<Block, Box<dyn error::Error>> {
        self.with(|codestream| codestream.open_block(band, index))
    }

    pub fn close_block(&self, block: Block) -> Result<(), Box<dyn error::Error>> {
        self.with_locked(LockId::PrecinctCheck, |codestream| codestream.close_block(block))
    }

    pub fn close_precinct(&self, precinct: Precinct) -> Result<bool, Box<dyn error::Error>> {
        self.with_locked(LockId::PrecinctCheck, |codestream| {
            Ok(codestream.close_precinct(precinct))
        })
    }

    pub fn flush(&self, options: FlushOptions) -> Result<(), Box<dyn error::Error>> {
        self.with_locked(LockId::Stats, |codestream| codestream.flush(options))
    }

    pub fn trans_out(&self, max_bytes: u64) -> Result<(), Box<dyn error::Error>> {
        self.with_locked(LockId::Stats, |codestream| codestream.trans_out(max_bytes))
    }

    pub fn total_bytes(&self) -> Result<u64, Box<dyn error::Error>> {
        self.with_locked(LockId::Stats, |codestream| Ok(codestream.total_bytes()))
    }

    pub fn into_inner(self) -> Codestream<'a> {
        self.codestream
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ComponentSize, SizParams};
    use crate::source::SimulatedTarget;

    fn env() -> ThreadEnv<'static> {
        let codestream = Codestream::create_output(
            SizParams::new(8, 8, vec![ComponentSize::new(8, false)]),
            SimulatedTarget::new(),
        );
        ThreadEnv::new(codestream)
    }

    #[test]
    fn test_locks() {
        let env = env();
        assert!(env.lock(LockId::App(3)).is_ok());
        assert!(env.lock(LockId::App(4)).is_err());
        let _general = env.lock(LockId::General).unwrap();
        assert!(env.lock(LockId::Stats).is_ok());
    }

    #[test]
    fn test_operations_hold_their_locks() {
        let env = env();
        env.with(|_| {
            assert!(env.locks[0].try_lock().is_err());
            assert!(env.locks[1].try_lock().is_ok());
        });
        assert!(env.locks[0].try_lock().is_ok());

        let held = env
            .with_locked(LockId::Stats, |_| {
                Ok((env.locks[0].try_lock().is_err(), env.locks[1].try_lock().is_err()))
            })
            .unwrap();
        assert_eq!(held, (true, true));
        assert!(env.locks[1].try_lock().is_ok());
    }

    #[test]
    fn test_application_lock_excludes_flush() {
        let env = env();
        let stats = env.lock(LockId::Stats).unwrap();
        std::thread::scope(|scope| {
            let flushed = scope.spawn(|| {
                let _ = env.total_bytes();
                env.locks[1].try_lock().is_ok()
            });
            // The worker is parked on the stats lock until it is dropped.
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!flushed.is_finished());
            drop(stats);
            assert!(flushed.join().unwrap());
        });
    }
}
