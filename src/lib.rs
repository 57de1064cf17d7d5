//! Asynchronous call-stack unwinding for sampling profilers.
//!
//! A sampling profiler interrupts a running program at arbitrary machine
//! instructions and must recover the chain of return addresses from inside
//! the signal handler, on code that was never compiled to cooperate. This
//! crate does that with *unwind recipes*: per-PC-range descriptions of
//! where the caller's stack pointer, frame pointer and return address live,
//! derived by scanning each function's machine code the first time a
//! sample lands in it and cached process-wide.
//!
//! ## Example
//!
//! ```no_run
//! use unwind_recipe::{init, init_cursor, Config, FnBounds, Host, Registers, Step};
//!
//! struct MyRuntime;
//!
//! impl Host for MyRuntime {
//!     fn enclosing_bounds(&self, pc: usize) -> Option<FnBounds> {
//!         // Consult your symbol tables here.
//!         None
//!     }
//!     fn in_outermost_frame(&self, pc: usize) -> bool {
//!         false
//!     }
//!     fn stack_bottom(&self) -> usize {
//!         usize::MAX
//!     }
//! }
//!
//! static RUNTIME: MyRuntime = MyRuntime;
//!
//! init(&RUNTIME, Config::default()).unwrap();
//! unwind_recipe::guard::thread_init();
//!
//! // From the sample signal handler, with `uc: &libc::ucontext_t`:
//! # let uc: libc::ucontext_t = unsafe { std::mem::zeroed() };
//! let chain = unwind_recipe::guard::protect_sample(|| {
//!     let regs = Registers::from_ucontext(&uc);
//!     let mut cursor = init_cursor(&regs).unwrap();
//!     let mut pcs = vec![cursor.ip()];
//!     loop {
//!         match cursor.step() {
//!             Step::Ok | Step::Troll => pcs.push(cursor.ip()),
//!             Step::Stop | Step::Error => break,
//!         }
//!     }
//!     pcs
//! });
//! ```
//!
//! ## Safety model
//!
//! Everything reachable from [`init_cursor`] and [`Cursor::step`] is
//! async-signal-safe: no allocation outside the crate's own arena, no
//! formatting, spinlocks instead of parking. Reads of foreign stacks and
//! code are recovered by a per-thread landing pad if they fault; see
//! [`guard`].
//!
//! The recipe cache and the fault handler are process-global: a signal
//! handler cannot thread parameters through the kernel, so the crate is
//! initialized once via [`init`] and used through free functions
//! afterwards.

use std::io;
use std::sync::OnceLock;

use thiserror::Error;

pub mod ctx;
pub mod cursor;
pub mod guard;
pub mod host;
pub mod map;
pub mod recipe;
pub mod stats;

mod arch;
mod ffi;
mod probe;

pub use ctx::{context_pc, Registers};
pub use cursor::{Cursor, Step};
pub use host::{FnBounds, Host};
pub use map::{Lookup, RecipeMap, Status};

/// Tunables fixed at [`init`] time.
///
/// Each field can be overridden by an environment variable, read once
/// during `init`: `UNWIND_RECIPE_ARENA_BYTES`, `UNWIND_RECIPE_SPIN_LIMIT`,
/// `UNWIND_RECIPE_TROLL_WORDS`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the recipe arena. Exhausting it is fatal.
    pub arena_bytes: usize,
    /// Iterations a signal-time spin may burn before the sample is
    /// dropped. Zero means spin forever (the historical default).
    pub spin_limit: usize,
    /// How many stack words the troller examines before giving up.
    pub troll_words: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { arena_bytes: 64 << 20, spin_limit: 0, troll_words: 256 }
    }
}

impl Config {
    fn with_env_overrides(mut self) -> Self {
        fn read(name: &str, into: &mut usize) {
            if let Ok(v) = std::env::var(name) {
                match v.parse() {
                    Ok(n) => *into = n,
                    Err(_) => log::warn!("ignoring unparsable {name}={v}"),
                }
            }
        }
        read("UNWIND_RECIPE_ARENA_BYTES", &mut self.arena_bytes);
        read("UNWIND_RECIPE_SPIN_LIMIT", &mut self.spin_limit);
        read("UNWIND_RECIPE_TROLL_WORDS", &mut self.troll_words);
        self
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("unwinder is already initialized")]
    AlreadyInitialized,
    #[error("initialization failed: {0}")]
    Os(#[from] io::Error),
}

static MAP: OnceLock<RecipeMap> = OnceLock::new();
static HOST: OnceLock<&'static dyn Host> = OnceLock::new();

/// Initializes the process-wide unwinder: builds the recipe map (all
/// address space poisoned until load modules are announced) and installs
/// the fault handler.
///
/// Call once, before sampling starts and before threads can fault inside
/// the unwinder.
pub fn init(host: &'static dyn Host, config: Config) -> Result<(), InitError> {
    let config = config.with_env_overrides();
    let map = RecipeMap::new(&config)?;
    if MAP.set(map).is_err() {
        return Err(InitError::AlreadyInitialized);
    }
    let _ = HOST.set(host);
    guard::thread_init();
    guard::install_fault_handler()?;
    log::info!("unwinder initialized");
    Ok(())
}

pub(crate) fn try_global_map() -> Option<&'static RecipeMap> {
    MAP.get()
}

fn globals() -> Option<(&'static RecipeMap, &'static dyn Host)> {
    Some((MAP.get()?, *HOST.get()?))
}

/// `[start, end)` has become executable; future samples there may consult
/// the bounds oracle. Invoked from dynamic-loader hooks, which serialize
/// map/unmap notifications externally.
pub fn notify_map(start: usize, end: usize) {
    if let Some(map) = MAP.get() {
        map.notify_map(start, end);
    }
}

/// `[start, end)` is going away; evict its records and repoison.
pub fn notify_unmap(start: usize, end: usize) {
    if let Some(map) = MAP.get() {
        map.notify_unmap(start, end);
    }
}

/// Starts an unwind against the process-global map. `None` until [`init`]
/// has run.
pub fn init_cursor(regs: &Registers) -> Option<Cursor<'static>> {
    let (map, host) = globals()?;
    Some(Cursor::init(map, host, regs))
}
