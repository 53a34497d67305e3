//! The operator portal: periodic stats rows plus the control server.
//!
//! A dedicated thread samples the manager once per second and prints one
//! row per server. The column header is re-printed every
//! `header_interval` rows; zero disables it entirely.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lserver_common::{Result, StatsRecord};

use crate::control::ControlServer;
use crate::manager::ServerManager;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(50);

pub struct Portal {
    control: ControlServer,
    stop_flag: Arc<AtomicBool>,
    printer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Portal {
    pub fn start(
        manager: ServerManager,
        header_interval: usize,
        control_addr: SocketAddr,
    ) -> Result<Self> {
        let control = ControlServer::start(manager.clone(), control_addr)?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let printer = std::thread::Builder::new()
            .name("lserver-portal".to_string())
            .spawn(move || print_loop(manager, header_interval, flag))
            .map_err(|e| lserver_common::LserverError::Listen(format!("portal thread: {}", e)))?;

        Ok(Self {
            control,
            stop_flag,
            printer: Mutex::new(Some(printer)),
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let printer = self.printer.lock().unwrap().take();
        if let Some(printer) = printer {
            let _ = printer.join();
        }
        self.control.stop();
    }
}

fn print_loop(manager: ServerManager, header_interval: usize, stop: Arc<AtomicBool>) {
    let mut rows_printed = 0usize;
    'sampling: loop {
        let mut waited = Duration::ZERO;
        while waited < SAMPLE_INTERVAL {
            if stop.load(Ordering::Acquire) {
                break 'sampling;
            }
            std::thread::sleep(STOP_POLL);
            waited += STOP_POLL;
        }

        for record in manager.get_stats() {
            if header_interval > 0 && rows_printed % header_interval == 0 {
                print_header();
            }
            print_row(&record);
            rows_printed += 1;
        }
    }
}

fn print_header() {
    println!(
        "{:>18} {:>10} {:>10} {:>10} {:>10} {:>14} {:>14}",
        "time_us", "accepted", "sessions", "in_flight", "tx_delta", "rx_bytes", "tx_bytes"
    );
}

fn print_row(record: &StatsRecord) {
    println!(
        "{:>18} {:>10} {:>10} {:>10} {:>10} {:>14} {:>14}",
        record.time_us,
        record.accepted,
        record.sessions_total,
        record.sessions_in_flight,
        record.transactions_delta,
        record.bytes_received_delta,
        record.bytes_sent_delta
    );
}
