// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Echo peer for cross-process tests: attaches to the descriptor stored in
// the given file, connects, and sends every received chunk sequence back
// unchanged. Exits when the channel disconnects.

use std::process::exit;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use shmchan::{ChannelManager, ConnectStatus, Connection, DataReceiver};

struct Echo {
    conn: Mutex<Weak<Connection>>,
}

impl DataReceiver for Echo {
    fn receive_data(&self, chunks: Vec<Vec<u8>>) {
        let conn = self.conn.lock().unwrap().upgrade();
        if let Some(conn) = conn {
            if let Err(e) = conn.send_data(&chunks) {
                log::error!("echo send failed: {e}");
            }
        }
    }
}

fn main() {
    env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: shm_repeater <descriptor-file>");
        exit(2);
    };
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("cannot read descriptor file '{path}': {e}");
            exit(2);
        }
    };

    let manager = ChannelManager::with_default_monitor();
    let conn = match manager.access(&text) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("cannot attach to channel: {e}");
            exit(1);
        }
    };

    let echo = Arc::new(Echo {
        conn: Mutex::new(Arc::downgrade(&conn)),
    });
    if let Err(e) = conn.async_connect(echo) {
        eprintln!("connect failed: {e}");
        exit(1);
    }

    if !conn.wait_for_connection(Some(Duration::from_secs(10))) {
        eprintln!("no peer showed up");
        exit(1);
    }
    log::info!("repeater connected");

    while conn.status() == ConnectStatus::Connected {
        std::thread::sleep(Duration::from_millis(50));
    }
    log::info!("repeater done");
}
