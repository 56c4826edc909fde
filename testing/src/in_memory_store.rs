//! In-memory implementation of the store client contract.
//!
//! Every statement is evaluated and applied under a single lock, which gives
//! linearizable compare-and-swap per partition. Consistency levels are validated
//! (a conditional write needs a serial level) and reported back in errors, but a
//! single in-process replica serves every level.

use crate::faults::{FaultPlan, ScriptedFault};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use vouchers_core::environment::{Clock, SystemClock};
use vouchers_core::ids::{ItemName, SaleId};
use vouchers_core::store::{
    Consistency, ItemRow, Mutation, SaleEvent, Statement, StoreClient, StoreError, StoreFuture,
    Table, WriteType,
};

/// Operation counters, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Point reads served
    pub reads: u64,
    /// Conditional statements received
    pub conditional_writes: u64,
    /// Unconditional statements received
    pub writes: u64,
    /// Write timeouts reported (scripted or random)
    pub injected_timeouts: u64,
}

#[derive(Debug, Default)]
struct Partition {
    units_sold: Option<u32>,
    sales: Vec<SaleEvent>,
}

struct StoreState {
    partitions: HashMap<(Table, ItemName), Partition>,
    scripted: VecDeque<ScriptedFault>,
    rng: StdRng,
    last_sale: Option<SaleId>,
    stats: StoreStats,
}

impl StoreState {
    fn partition(&self, table: Table, item: &ItemName) -> Option<&Partition> {
        self.partitions
            .get(&(table, item.clone()))
            .filter(|partition| partition.units_sold.is_some())
    }

    fn row(&self, table: Table, item: &ItemName) -> Option<ItemRow> {
        let units_sold = self.partition(table, item)?.units_sold?;
        Some(ItemRow { units_sold })
    }

    fn sales(&self, item: &ItemName) -> Option<Vec<SaleEvent>> {
        self.partition(Table::Vouchers, item)
            .map(|partition| partition.sales.clone())
    }

    fn condition_holds(&self, mutation: &Mutation) -> bool {
        let (table, item) = mutation.partition();
        let current = self
            .partitions
            .get(&(table, item.clone()))
            .and_then(|p| p.units_sold);

        match mutation {
            Mutation::InsertIfNotExists { .. } => current.is_none(),
            Mutation::SetUnitsSoldIf { expected, .. } => current == Some(*expected),
            Mutation::SetUnitsSold { .. }
            | Mutation::AppendSale { .. }
            | Mutation::Delete { .. } => true,
        }
    }

    fn conditions_hold(&self, statement: &Statement) -> bool {
        statement
            .mutations()
            .iter()
            .all(|mutation| self.condition_holds(mutation))
    }

    fn next_sale_id(&mut self, now: DateTime<Utc>) -> SaleId {
        let id = match self.last_sale {
            Some(last) => SaleId::new(now.max(last.timestamp()), last.sequence() + 1),
            None => SaleId::new(now, 1),
        };
        self.last_sale = Some(id);
        id
    }

    fn apply(&mut self, statement: &Statement, now: DateTime<Utc>) {
        for mutation in statement.mutations() {
            match mutation {
                Mutation::InsertIfNotExists {
                    table,
                    item,
                    units_sold,
                }
                | Mutation::SetUnitsSold {
                    table,
                    item,
                    units_sold,
                }
                | Mutation::SetUnitsSoldIf {
                    table,
                    item,
                    units_sold,
                    ..
                } => {
                    self.partitions
                        .entry((*table, item.clone()))
                        .or_default()
                        .units_sold = Some(*units_sold);
                }
                Mutation::AppendSale { item, buyer } => {
                    let id = self.next_sale_id(now);
                    self.partitions
                        .entry((Table::Vouchers, item.clone()))
                        .or_default()
                        .sales
                        .push(SaleEvent {
                            id,
                            buyer: buyer.clone(),
                        });
                }
                Mutation::Delete { table, item } => {
                    self.partitions.remove(&(*table, item.clone()));
                }
            }
        }
    }
}

/// In-memory, fault-injectable store.
///
/// # Examples
///
/// ```
/// use vouchers_core::ids::ItemName;
/// use vouchers_core::store::{Consistency, Mutation, Statement, StoreClient, Table};
/// use vouchers_testing::InMemoryStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStore::new();
/// let create = Statement::Single(Mutation::InsertIfNotExists {
///     table: Table::VouchersMutable,
///     item: ItemName::new("free tv"),
///     units_sold: 0,
/// });
///
/// let applied = store
///     .execute_conditional(create, Consistency::LocalQuorum, Consistency::LocalSerial)
///     .await;
/// assert_eq!(applied, Ok(true));
/// # });
/// ```
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    plan: FaultPlan,
}

impl InMemoryStore {
    /// Create an empty, fault-free store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fault_plan(FaultPlan::none())
    }

    /// Create an empty store injecting faults according to `plan`.
    ///
    /// Probabilities outside `[0, 1]` are clamped; use [`FaultPlan::validate`] to
    /// reject them instead.
    #[must_use]
    pub fn with_fault_plan(plan: FaultPlan) -> Self {
        let plan = plan.sanitized();
        Self {
            state: Mutex::new(StoreState {
                partitions: HashMap::new(),
                scripted: VecDeque::new(),
                rng: StdRng::seed_from_u64(plan.seed),
                last_sale: None,
                stats: StoreStats::default(),
            }),
            clock: Arc::new(SystemClock),
            plan,
        }
    }

    /// Replace the clock used to stamp sale ids.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The (sanitized) fault plan in effect.
    #[must_use]
    pub const fn fault_plan(&self) -> &FaultPlan {
        &self.plan
    }

    /// Queue a fault for the next conditional write.
    pub async fn push_fault(&self, fault: ScriptedFault) {
        self.state.lock().await.scripted.push_back(fault);
    }

    /// Number of scripted faults not yet consumed.
    pub async fn pending_faults(&self) -> usize {
        self.state.lock().await.scripted.len()
    }

    /// Snapshot of the operation counters.
    pub async fn stats(&self) -> StoreStats {
        self.state.lock().await.stats
    }

    fn validate_conditional(
        statement: &Statement,
        serial_consistency: Consistency,
    ) -> Result<(), StoreError> {
        if !serial_consistency.is_serial() {
            return Err(StoreError::InvalidQuery(format!(
                "{serial_consistency} is not a serial consistency level"
            )));
        }
        if !statement.is_conditional() {
            return Err(StoreError::InvalidQuery(
                "conditional execution requires a condition".to_string(),
            ));
        }
        let mut partitions = statement.mutations().iter().map(Mutation::partition);
        if let Some(first) = partitions.next() {
            if partitions.any(|p| p != first) {
                return Err(StoreError::InvalidQuery(
                    "conditional batch cannot span multiple partitions".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn timeout(
        state: &mut StoreState,
        write_type: WriteType,
        consistency: Consistency,
    ) -> StoreError {
        state.stats.injected_timeouts += 1;
        StoreError::WriteTimeout {
            write_type,
            consistency,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl StoreClient for InMemoryStore {
    fn read(
        &self,
        table: Table,
        item: ItemName,
        _consistency: Consistency,
    ) -> StoreFuture<'_, Option<ItemRow>> {
        Box::pin(async move {
            let row = {
                let mut state = self.state.lock().await;
                state.stats.reads += 1;
                state.row(table, &item)
            };

            if let Some(delay) = self.plan.read_delay() {
                tokio::time::sleep(delay).await;
            }

            Ok(row)
        })
    }

    fn read_sales(
        &self,
        item: ItemName,
        _consistency: Consistency,
    ) -> StoreFuture<'_, Option<Vec<SaleEvent>>> {
        Box::pin(async move {
            let sales = {
                let mut state = self.state.lock().await;
                state.stats.reads += 1;
                state.sales(&item)
            };

            if let Some(delay) = self.plan.read_delay() {
                tokio::time::sleep(delay).await;
            }

            Ok(sales)
        })
    }

    fn execute_conditional(
        &self,
        statement: Statement,
        consistency: Consistency,
        serial_consistency: Consistency,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            Self::validate_conditional(&statement, serial_consistency)?;

            let now = self.clock.now();
            let mut state = self.state.lock().await;
            state.stats.conditional_writes += 1;
            let holds = state.conditions_hold(&statement);

            if let Some(fault) = state.scripted.pop_front() {
                tracing::debug!(?fault, holds, "Injecting scripted fault");
                return match fault {
                    ScriptedFault::Unavailable => Err(StoreError::Unavailable { consistency }),
                    ScriptedFault::WriteTimeout { write_type, .. }
                        if write_type == WriteType::Simple
                            && statement.has_unconditional_member()
                            && !holds =>
                    {
                        Ok(false)
                    }
                    ScriptedFault::WriteTimeout {
                        write_type,
                        applied,
                    } => {
                        if applied && holds {
                            state.apply(&statement, now);
                        }
                        let level = if write_type == WriteType::Cas {
                            serial_consistency
                        } else {
                            consistency
                        };
                        Err(Self::timeout(&mut state, write_type, level))
                    }
                };
            }

            if state.rng.gen_bool(self.plan.cas_timeout_probability) {
                let committed =
                    holds && state.rng.gen_bool(self.plan.commit_on_cas_timeout_probability);
                if committed {
                    state.apply(&statement, now);
                }
                tracing::debug!(committed, "Injecting CAS-phase timeout");
                return Err(Self::timeout(&mut state, WriteType::Cas, serial_consistency));
            }

            if !holds {
                return Ok(false);
            }

            state.apply(&statement, now);

            if statement.has_unconditional_member()
                && state.rng.gen_bool(self.plan.secondary_timeout_probability)
            {
                tracing::debug!("Injecting secondary-phase timeout");
                return Err(Self::timeout(&mut state, WriteType::Simple, consistency));
            }

            Ok(true)
        })
    }

    fn execute(&self, statement: Statement, _consistency: Consistency) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if statement.is_conditional() {
                return Err(StoreError::InvalidQuery(
                    "conditional statement submitted for unconditional execution".to_string(),
                ));
            }

            let now = self.clock.now();
            let mut state = self.state.lock().await;
            state.stats.writes += 1;
            state.apply(&statement, now);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mocks::test_clock;
    use vouchers_core::ids::BuyerId;

    fn item() -> ItemName {
        ItemName::new("free tv")
    }

    fn insert(table: Table) -> Statement {
        Statement::Single(Mutation::InsertIfNotExists {
            table,
            item: item(),
            units_sold: 0,
        })
    }

    fn cas(expected: u32) -> Statement {
        Statement::Single(Mutation::SetUnitsSoldIf {
            table: Table::VouchersMutable,
            item: item(),
            units_sold: expected + 1,
            expected,
        })
    }

    fn audited_sale(expected: u32, buyer: &str) -> Statement {
        Statement::Batch(vec![
            Mutation::SetUnitsSoldIf {
                table: Table::Vouchers,
                item: item(),
                units_sold: expected + 1,
                expected,
            },
            Mutation::AppendSale {
                item: item(),
                buyer: BuyerId::new(buyer),
            },
        ])
    }

    async fn conditional(store: &InMemoryStore, statement: Statement) -> Result<bool, StoreError> {
        store
            .execute_conditional(statement, Consistency::LocalQuorum, Consistency::LocalSerial)
            .await
    }

    async fn units(store: &InMemoryStore, table: Table) -> Option<u32> {
        store
            .read(table, item(), Consistency::LocalSerial)
            .await
            .unwrap()
            .map(|row| row.units_sold)
    }

    #[tokio::test]
    async fn insert_if_not_exists_applies_once() {
        let store = InMemoryStore::new();

        assert_eq!(conditional(&store, insert(Table::VouchersMutable)).await, Ok(true));
        assert_eq!(conditional(&store, insert(Table::VouchersMutable)).await, Ok(false));
        assert_eq!(units(&store, Table::VouchersMutable).await, Some(0));
    }

    #[tokio::test]
    async fn tables_are_separate_namespaces() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::Vouchers)).await.unwrap();

        assert_eq!(units(&store, Table::VouchersMutable).await, None);
        assert_eq!(units(&store, Table::Vouchers).await, Some(0));
    }

    #[tokio::test]
    async fn compare_and_swap_requires_the_expected_value() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::VouchersMutable)).await.unwrap();

        assert_eq!(conditional(&store, cas(0)).await, Ok(true));
        assert_eq!(conditional(&store, cas(0)).await, Ok(false));
        assert_eq!(units(&store, Table::VouchersMutable).await, Some(1));
    }

    #[tokio::test]
    async fn compare_and_swap_on_missing_item_does_not_apply() {
        let store = InMemoryStore::new();
        assert_eq!(conditional(&store, cas(0)).await, Ok(false));
        assert_eq!(units(&store, Table::VouchersMutable).await, None);
    }

    #[tokio::test]
    async fn conditional_batch_is_all_or_nothing() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::Vouchers)).await.unwrap();

        assert_eq!(conditional(&store, audited_sale(0, "client 0")).await, Ok(true));
        assert_eq!(conditional(&store, audited_sale(0, "client 1")).await, Ok(false));

        let sales = store
            .read_sales(item(), Consistency::LocalSerial)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(units(&store, Table::Vouchers).await, Some(1));
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].buyer, BuyerId::new("client 0"));
    }

    #[tokio::test]
    async fn sale_ids_increase_even_with_a_fixed_clock() {
        let store = InMemoryStore::new().with_clock(Arc::new(test_clock()));
        conditional(&store, insert(Table::Vouchers)).await.unwrap();

        for sold in 0..3 {
            conditional(&store, audited_sale(sold, "client")).await.unwrap();
        }

        let sales = store
            .read_sales(item(), Consistency::LocalSerial)
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<SaleId> = sales.iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn conditional_batch_cannot_span_partitions() {
        let store = InMemoryStore::new();
        let batch = Statement::Batch(vec![
            Mutation::SetUnitsSoldIf {
                table: Table::Vouchers,
                item: item(),
                units_sold: 1,
                expected: 0,
            },
            Mutation::AppendSale {
                item: ItemName::new("other"),
                buyer: BuyerId::new("client 0"),
            },
        ]);

        assert!(matches!(
            conditional(&store, batch).await,
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn conditional_write_requires_serial_consistency() {
        let store = InMemoryStore::new();
        let result = store
            .execute_conditional(
                insert(Table::Vouchers),
                Consistency::LocalQuorum,
                Consistency::LocalQuorum,
            )
            .await;
        assert!(matches!(result, Err(StoreError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn plain_execute_rejects_conditions_and_deletes_idempotently() {
        let store = InMemoryStore::new();

        let result = store
            .execute(insert(Table::Vouchers), Consistency::LocalQuorum)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidQuery(_))));

        let delete = Statement::Single(Mutation::Delete {
            table: Table::Vouchers,
            item: item(),
        });
        assert_eq!(store.execute(delete.clone(), Consistency::LocalQuorum).await, Ok(()));
        assert_eq!(store.execute(delete, Consistency::LocalQuorum).await, Ok(()));
    }

    #[tokio::test]
    async fn scripted_timeout_can_still_commit() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::VouchersMutable)).await.unwrap();
        store
            .push_fault(ScriptedFault::WriteTimeout {
                write_type: WriteType::Cas,
                applied: true,
            })
            .await;

        let result = conditional(&store, cas(0)).await;
        assert_eq!(
            result,
            Err(StoreError::WriteTimeout {
                write_type: WriteType::Cas,
                consistency: Consistency::LocalSerial,
            })
        );
        assert_eq!(units(&store, Table::VouchersMutable).await, Some(1));
        assert_eq!(store.pending_faults().await, 0);
        assert_eq!(store.stats().await.injected_timeouts, 1);
    }

    #[tokio::test]
    async fn scripted_unavailable_applies_nothing() {
        let store = InMemoryStore::new();
        store.push_fault(ScriptedFault::Unavailable).await;

        let result = conditional(&store, insert(Table::Vouchers)).await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
        assert_eq!(units(&store, Table::Vouchers).await, None);
    }

    #[tokio::test]
    async fn certain_secondary_timeout_still_applies_the_batch() {
        let store = InMemoryStore::with_fault_plan(FaultPlan {
            secondary_timeout_probability: 1.0,
            ..FaultPlan::default()
        });
        conditional(&store, insert(Table::Vouchers)).await.unwrap();

        let result = conditional(&store, audited_sale(0, "client 0")).await;
        assert!(matches!(
            result,
            Err(StoreError::WriteTimeout {
                write_type: WriteType::Simple,
                ..
            })
        ));
        assert_eq!(units(&store, Table::Vouchers).await, Some(1));
    }

    #[tokio::test]
    async fn secondary_timeout_needs_a_condition_that_held() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::Vouchers)).await.unwrap();
        conditional(&store, audited_sale(0, "client 0")).await.unwrap();
        store
            .push_fault(ScriptedFault::WriteTimeout {
                write_type: WriteType::Simple,
                applied: true,
            })
            .await;

        // Stale expected count: the condition fails before the secondary phase.
        assert_eq!(conditional(&store, audited_sale(0, "client 1")).await, Ok(false));
        assert_eq!(units(&store, Table::Vouchers).await, Some(1));
        assert_eq!(store.pending_faults().await, 0);
        assert_eq!(store.stats().await.injected_timeouts, 0);
    }

    #[tokio::test]
    async fn simple_tag_on_a_single_statement_is_still_reported() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::VouchersMutable)).await.unwrap();
        store
            .push_fault(ScriptedFault::WriteTimeout {
                write_type: WriteType::Simple,
                applied: false,
            })
            .await;

        let result = conditional(&store, cas(5)).await;
        assert_eq!(
            result,
            Err(StoreError::WriteTimeout {
                write_type: WriteType::Simple,
                consistency: Consistency::LocalQuorum,
            })
        );
        assert_eq!(units(&store, Table::VouchersMutable).await, Some(0));
    }

    #[tokio::test]
    async fn count_reads_leave_the_audit_trail_behind() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::Vouchers)).await.unwrap();
        for sold in 0..3 {
            conditional(&store, audited_sale(sold, "client")).await.unwrap();
        }

        let row = store
            .read(Table::Vouchers, item(), Consistency::LocalSerial)
            .await
            .unwrap();
        assert_eq!(row, Some(ItemRow { units_sold: 3 }));
        let missing = store
            .read_sales(ItemName::new("ghost"), Consistency::LocalSerial)
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn stats_count_operations() {
        let store = InMemoryStore::new();
        conditional(&store, insert(Table::VouchersMutable)).await.unwrap();
        let _ = units(&store, Table::VouchersMutable).await;
        store
            .execute(
                Statement::Single(Mutation::SetUnitsSold {
                    table: Table::VouchersMutable,
                    item: item(),
                    units_sold: 9,
                }),
                Consistency::LocalQuorum,
            )
            .await
            .unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.conditional_writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
    }
}
