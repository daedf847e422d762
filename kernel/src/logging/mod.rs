// src/logging/mod.rs
//
// カーネルログ。
// - 実機: VGA テキスト画面（physmap 経由）と COM1 の両方へ出す
// - host: 標準エラーへ出す（cargo test の出力キャプチャに乗る）
//
// API:
// - info / error: 固定文字列 1 行
// - info_u64: "key = 10進" 1 行（ヒープ無しで数値を出す）
// - info_fmt: format_args! をそのまま 1 行
// - console_write: プレフィックス無しの生出力（sys_cputs 用。VGA では白で描く）

use core::fmt;

#[cfg(target_os = "none")]
mod serial;
#[cfg(target_os = "none")]
mod vga;

#[cfg(target_os = "none")]
pub use serial::try_read_byte as serial_try_read_byte;

/// phys_offset: bootloader の physmap の先頭（VGA 0xb8000 はここからの相対で触る）
#[cfg(target_os = "none")]
pub fn init(phys_offset: u64) {
    vga::init(phys_offset);
    serial::init();
}

#[cfg(target_os = "none")]
fn emit(prefix: &str, args: fmt::Arguments<'_>) {
    use core::fmt::Write;

    let mut s = serial::SerialWriter;
    let _ = s.write_str(prefix);
    let _ = s.write_fmt(args);
    let _ = s.write_str("\r\n");
    vga::write_line(prefix, args);
}

#[cfg(not(target_os = "none"))]
fn emit(prefix: &str, args: fmt::Arguments<'_>) {
    eprintln!("{}{}", prefix, args);
}

pub fn info(msg: &str) {
    emit("[INFO] ", format_args!("{}", msg));
}

pub fn error(msg: &str) {
    emit("[ERROR] ", format_args!("{}", msg));
}

pub fn info_u64(label: &str, value: u64) {
    if label.is_empty() {
        emit("[INFO] ", format_args!("{}", value));
    } else {
        emit("[INFO] ", format_args!("{} = {}", label, value));
    }
}

pub fn info_fmt(args: fmt::Arguments<'_>) {
    emit("[INFO] ", args);
}

/// user の出力をそのまま流す
#[cfg(target_os = "none")]
pub fn console_write(bytes: &[u8]) {
    bytes.iter().for_each(|&b| serial::write_byte(b));
    vga::write_bytes(bytes, vga::Style::User);
}

#[cfg(not(target_os = "none"))]
pub fn console_write(bytes: &[u8]) {
    eprint!("{}", String::from_utf8_lossy(bytes));
}
