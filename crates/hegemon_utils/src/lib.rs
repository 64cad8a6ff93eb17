//! Various utilities shared by the Hegemon engine crates

mod atomic_f64;
pub use atomic_f64::AtomicF64;

mod count_guard;
pub use count_guard::CountGuard;

mod ema;
pub use ema::Ema;

pub type AnyResult<T = (), E = anyhow::Error> = anyhow::Result<T, E>;

/// Shorthand for `Ok(())`, cause it looks ugly
pub const fn ok<E>() -> Result<(), E> {
    Ok(())
}
