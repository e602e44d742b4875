//! No-echo and idempotence at the ledger seam: a write applied in one
//! direction suppresses the identical content arriving from the opposite
//! direction within the window, and nothing else.

use std::time::Duration;

use sheetsync::core::ledger::Ledger;
use sheetsync::types::{Direction, Fingerprint};

fn fp(s: &str) -> Fingerprint {
    Fingerprint::from_hex(s.to_string())
}

#[test]
fn sheet_to_db_write_suppresses_db_to_sheet_echo() {
    let ledger = Ledger::new(Duration::from_secs(10)).unwrap();

    // Poller applied content X to the DB
    ledger.remember(&fp("x"), Direction::SheetToDb);

    // The trigger enqueues it; the consumer asks about the opposite
    // direction before writing the sheet
    assert!(ledger.should_skip(&fp("x"), Direction::SheetToDb));
}

#[test]
fn db_to_sheet_write_suppresses_poller_echo() {
    let ledger = Ledger::new(Duration::from_secs(10)).unwrap();

    // Consumer applied content Y to the sheet
    ledger.remember(&fp("y"), Direction::DbToSheet);

    // The next poll sees Y as an apparent sheet edit
    assert!(ledger.should_skip(&fp("y"), Direction::DbToSheet));
}

#[test]
fn different_content_is_never_suppressed() {
    let ledger = Ledger::new(Duration::from_secs(10)).unwrap();
    ledger.remember(&fp("x"), Direction::SheetToDb);
    assert!(!ledger.should_skip(&fp("z"), Direction::SheetToDb));
}

#[test]
fn repeated_application_within_window_is_idempotent() {
    let ledger = Ledger::new(Duration::from_secs(10)).unwrap();
    ledger.remember(&fp("x"), Direction::SheetToDb);
    // Asking twice changes nothing
    assert!(ledger.should_skip(&fp("x"), Direction::SheetToDb));
    assert!(ledger.should_skip(&fp("x"), Direction::SheetToDb));
}

#[test]
fn concurrent_remember_and_skip() {
    use std::sync::Arc;
    let ledger = Arc::new(Ledger::new(Duration::from_secs(10)).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                for i in 0..250 {
                    ledger.remember(&fp(&format!("{}-{}", w, i)), Direction::SheetToDb);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    // Everything remembered is found; the cap may have evicted nothing at
    // this volume
    assert!(ledger.should_skip(&fp("0-0"), Direction::SheetToDb));
    assert!(ledger.should_skip(&fp("3-249"), Direction::SheetToDb));
}
