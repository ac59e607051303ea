//! Run orchestration engine.
//!
//! | Module         | Role                                                     |
//! |----------------|----------------------------------------------------------|
//! | `models`       | Run record, statuses, agent events                       |
//! | `workspace`    | Per-run git checkouts under a managed root               |
//! | `lease`        | Lock files marking which process owns a live run         |
//! | `driver`       | Agent process capability interface and implementations   |
//! | `machine`      | Pure status transition logic                             |
//! | `orchestrator` | Setup, per-run workers, approval, cancel, teardown       |
//! | `store`        | Run persistence (SQLite, in-memory)                      |
//! | `notify`       | Outward progress notifications                           |

pub mod driver;
pub mod lease;
pub mod machine;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod store;
pub mod workspace;
