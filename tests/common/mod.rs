//! Common test infrastructure
//!
//! Integration tests open one or more queues on a shared temporary database
//! file. Each queue opened through [`TestDb::open_queue`] has its own
//! connection, the same way separate worker processes would.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestDb;
//!
//! #[test]
//! fn test_push_and_pop() {
//!     let db = TestDb::new();
//!     let queue = db.open_queue();
//!     queue.push(b"payload".to_vec(), None).unwrap();
//!     assert!(queue.pop(None).unwrap().is_some());
//! }
//! ```

mod fixtures;

pub use fixtures::{TestDb, BUSY_TIMEOUT, START_TIMESTAMP};
