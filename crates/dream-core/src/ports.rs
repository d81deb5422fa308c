//! Test port source
//!
//! Picks a random unused local TCP port inside a random 2000-wide window of
//! [2000, 65535]. Candidate ports are probed with a bind, which excludes
//! anything the OS reports as actively listening, and reserved ports are
//! remembered in a process-wide used set so the same port is never handed
//! out twice within a process.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;

const RANGE_START: u16 = 2000;
const RANGE_END: u16 = 65535;
const WINDOW: u16 = 2000;
const MAX_ATTEMPTS: usize = 5000;
const MAX_WINDOWS: usize = 8;

static USED: Lazy<Mutex<HashSet<u16>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Reserve an unused local TCP port. Returns `None` when every attempt in
/// several reseeded windows failed.
pub fn reserve_port() -> Option<u16> {
    let mut rng = rand::rng();
    for _ in 0..MAX_WINDOWS {
        let span = u32::from(RANGE_END - RANGE_START - WINDOW);
        let window_start = RANGE_START + rng.random_range(0..=span) as u16;
        for _ in 0..MAX_ATTEMPTS / MAX_WINDOWS {
            let port = window_start + rng.random_range(0..u32::from(WINDOW)) as u16;
            let mut used = USED.lock();
            if used.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                used.insert(port);
                return Some(port);
            }
        }
        // window exhausted, reseed and try elsewhere
    }
    None
}

/// Return a previously reserved port to the pool
pub fn release_port(port: u16) {
    USED.lock().remove(&port);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ports_are_unique_and_bindable() {
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let port = reserve_port().expect("a free port");
            assert!((RANGE_START..=RANGE_END).contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
            // still bindable right after reservation
            TcpListener::bind(("127.0.0.1", port)).unwrap();
        }
        for port in seen {
            release_port(port);
        }
    }

    #[test]
    fn release_makes_port_available_again() {
        let port = reserve_port().unwrap();
        assert!(USED.lock().contains(&port));
        release_port(port);
        assert!(!USED.lock().contains(&port));
    }
}
