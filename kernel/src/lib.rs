// kernel/src/lib.rs
//
// exo-kernel のライブラリ本体。
// - 実機（target_os = "none"）: no_std。arch / panic ハンドラ / bootloader 連携を含む
// - host: std。Kernel コアを hosted::SimHal の上で動かし、cargo test で検証する
//
// 依存の向き:
//   types / error  ←  mem / mm  ←  kernel  ←  arch（実機） / hosted（host）

#![cfg_attr(target_os = "none", no_std)]

pub mod error;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod types;

pub mod kernel;

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
mod panic;

#[cfg(not(target_os = "none"))]
pub mod hosted;

pub use error::{Error, KResult};
pub use kernel::{CpuId, Dispatch, Kernel};
