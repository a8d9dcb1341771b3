// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// abantaboot/src/serial.rs
//! COM1 as the log sink and as the module console.
//!
//! Nothing here allocates, so it keeps working after ExitBootServices.

use core::fmt::Write;

use abanta_kernel::module::Console;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use uart_16550::SerialPort;

static COM1: Mutex<Option<SerialPort>> = Mutex::new(None);
static LOGGER: SerialLogger = SerialLogger;

/// Bring up COM1 and route the `log` facade to it.
pub fn init(level: LevelFilter) {
    let mut port = unsafe { SerialPort::new(0x3F8) };
    port.init();
    *COM1.lock() = Some(port);

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn write_str(s: &str) {
    if let Some(ref mut port) = *COM1.lock() {
        for &b in s.as_bytes() {
            if b == b'\n' {
                port.send(b'\r');
            }
            port.send(b);
        }
    }
}

pub struct Serial;

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        write_str(s);
        Ok(())
    }
}

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(Serial, "{:>5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// What modules reach through `print_line`.
pub struct SerialConsole;

impl Console for SerialConsole {
    fn write_line(&self, line: &str) {
        let _ = writeln!(Serial, "{line}");
    }
}
