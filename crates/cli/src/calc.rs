//! Demo calculator service.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use perm::{Implementation, Operation, OperationTable, Shape, Template};
use tokio::sync::mpsc;

/// Upper bound on a single `Ticks` stream.
const MAX_TICKS: u32 = 1000;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Built-in template for [`Calc`].
pub fn template() -> Template {
    Template::new("Calc")
        .slot("Add", Shape::Value, "admin")
        .slot("Reset", Shape::Unit, "admin")
        .slot("Total", Shape::Value, "read")
        .slot("Version", Shape::Value, "read")
        .slot("Ticks", Shape::Stream, "read")
        .excluded("Ignore", Shape::Unit)
}

/// Adds numbers into a running total.
#[derive(Debug, Default, Clone)]
pub struct Calc {
    total: Arc<AtomicI64>,
}

impl Calc {
    pub fn new() -> Self {
        Self::default()
    }

    /// The operation table served for this calculator.
    pub fn operations(&self) -> OperationTable {
        let add = Arc::clone(&self.total);
        let reset = Arc::clone(&self.total);
        let total = Arc::clone(&self.total);

        OperationTable::new()
            .with(
                "Add",
                Operation::value("Add", move |_ctx, (a, b): (i64, i64)| {
                    let result = a.checked_add(b);
                    if let Some(sum) = result {
                        add.fetch_add(sum, Ordering::SeqCst);
                    }
                    async move { result.ok_or("integer overflow") }
                }),
            )
            .with(
                "Reset",
                Operation::unit("Reset", move |_ctx, (): ()| {
                    reset.store(0, Ordering::SeqCst);
                    async { Ok::<_, String>(()) }
                }),
            )
            .with(
                "Total",
                Operation::value("Total", move |_ctx, (): ()| {
                    let value = total.load(Ordering::SeqCst);
                    async move { Ok::<_, String>(value) }
                }),
            )
            .with(
                "Version",
                Operation::value("Version", |_ctx, (): ()| async {
                    Ok::<_, String>(env!("CARGO_PKG_VERSION"))
                }),
            )
            .with(
                "Ticks",
                Operation::stream("Ticks", |_ctx, (count,): (u32,)| async move {
                    if count > MAX_TICKS {
                        return Err(format!("at most {MAX_TICKS} ticks per stream"));
                    }
                    let (tx, rx) = mpsc::channel(1);
                    tokio::spawn(async move {
                        let mut interval = tokio::time::interval(TICK_INTERVAL);
                        for tick in 1..=count {
                            interval.tick().await;
                            if tx.send(tick).await.is_err() {
                                return;
                            }
                        }
                    });
                    Ok(rx)
                }),
            )
            .with(
                "Ignore",
                Operation::unit("Ignore", |_ctx, (): ()| async { Ok::<_, String>(()) }),
            )
    }
}

impl Implementation for Calc {
    fn operation(&self, name: &str) -> Option<Operation> {
        self.operations().operation(name)
    }
}
