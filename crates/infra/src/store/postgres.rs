//! Postgres-backed billing store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) | Any other | `Backend` |
//! | RowNotFound / PoolClosed / other | N/A | `Backend` |
//!
//! ## Transitions
//!
//! `commit_transition` locks the invoice row (`SELECT ... FOR UPDATE`),
//! compares the stored status with the planned `from`, then updates the
//! invoice and inserts the history row in the same transaction. A lost race
//! surfaces as `StoreError::Conflict` and nothing is written.
//!
//! ## Line-item writes
//!
//! `write_line_item` and `recompute_totals` take the same row lock, write the
//! item, then recompute the totals from the rows the transaction sees. Two
//! processes editing one invoice queue on the lock instead of racing the
//! totals. Two inserts that picked the same `line_order` hit the
//! `(invoice_id, line_order)` unique key and the loser gets `Duplicate`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use billflow_core::{ClientId, HistoryEntryId, InvoiceId, LineItemId, Metadata, UserId};
use billflow_invoicing::{
    HistoryQuery, Invoice, InvoiceRecord, InvoiceStatus, LineItem, LineItemRecord, SortOrder,
    StatusHistoryEntry, TimestampEffect, calculate_invoice_totals,
};

use super::r#trait::{
    InvoiceFilter, InvoiceStore, LineItemStore, LineItemWrite, StatusHistoryStore, StoreError,
    TransitionCommit, TransitionReceipt,
};

const SCHEMA: &str = include_str!("schema.sql");

const INVOICE_COLUMNS: &str = "id, invoice_number, client_id, status, invoice_date, due_date, \
     currency, notes, sent_at, paid_at, subtotal_amount, tax_amount, total_amount, \
     created_at, updated_at";

const LINE_ITEM_COLUMNS: &str = "id, invoice_id, description, quantity, unit_price, tax_rate, \
     tax_included, line_order, metadata, created_at, updated_at, deleted_at";

const HISTORY_COLUMNS: &str =
    "sequence, id, invoice_id, from_status, to_status, reason, metadata, changed_by, created_at";

/// Postgres-backed store. `Send + Sync`; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresBillingStore {
    pool: Arc<PgPool>,
}

impl PostgresBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl InvoiceStore for PostgresBillingStore {
    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id()), err)]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let totals = invoice.totals();
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, invoice_number, client_id, status, invoice_date, due_date,
                currency, notes, sent_at, paid_at, subtotal_amount, tax_amount,
                total_amount, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(*invoice.id().as_uuid())
        .bind(invoice.invoice_number())
        .bind(invoice.client_id().map(Uuid::from))
        .bind(invoice.status().as_str())
        .bind(invoice.invoice_date())
        .bind(invoice.due_date())
        .bind(invoice.currency())
        .bind(invoice.notes())
        .bind(invoice.sent_at())
        .bind(invoice.paid_at())
        .bind(totals.subtotal_amount)
        .bind(totals.total_tax_amount)
        .bind(totals.total_amount)
        .bind(invoice.created_at())
        .bind(invoice.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_invoice", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn get_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_invoice", e))?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::date IS NULL OR due_date < $2)
            ORDER BY due_date ASC, created_at ASC, id ASC
            LIMIT $3 OFFSET $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.due_before)
            .bind(filter.limit.map(|l| l as i64))
            .bind(filter.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_invoices", e))?;
        rows.iter().map(invoice_from_row).collect()
    }

    #[instrument(
        skip(self, commit),
        fields(
            invoice_id = %commit.invoice_id,
            from = %commit.plan.from(),
            to = %commit.plan.to()
        ),
        err
    )]
    async fn commit_transition(
        &self,
        commit: TransitionCommit,
    ) -> Result<TransitionReceipt, StoreError> {
        let invoice_uuid = *commit.invoice_id.as_uuid();
        let expected = commit.plan.from();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1 FOR UPDATE")
                .bind(invoice_uuid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_invoice", e))?;

        let Some(current) = current else {
            return Err(StoreError::NotFound(format!("invoice {}", commit.invoice_id)));
        };
        let current: InvoiceStatus = current.parse()?;
        if current != expected {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Conflict {
                invoice_id: commit.invoice_id,
                expected,
                actual: current,
            });
        }

        let (sent_at, paid_at) = match commit.plan.timestamp_effect() {
            Some(TimestampEffect::SentAt) => (Some(commit.at), None),
            Some(TimestampEffect::PaidAt) => (None, Some(commit.at)),
            None => (None, None),
        };

        let sql = format!(
            r#"
            UPDATE invoices
            SET status = $2,
                sent_at = COALESCE($3, sent_at),
                paid_at = COALESCE($4, paid_at),
                updated_at = $5
            WHERE id = $1 AND status = $6
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(invoice_uuid)
            .bind(commit.plan.to().as_str())
            .bind(sent_at)
            .bind(paid_at)
            .bind(commit.at)
            .bind(expected.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;
        let invoice = invoice_from_row(&row)?;

        let entry_id = HistoryEntryId::new();
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO invoice_status_history (
                id, invoice_id, from_status, to_status, reason, metadata, changed_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING sequence
            "#,
        )
        .bind(*entry_id.as_uuid())
        .bind(invoice_uuid)
        .bind(expected.as_str())
        .bind(commit.plan.to().as_str())
        .bind(commit.reason.as_deref())
        .bind(Json(&commit.metadata))
        .bind(commit.changed_by.map(Uuid::from))
        .bind(commit.at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_history", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let entry = StatusHistoryEntry {
            id: entry_id,
            invoice_id: commit.invoice_id,
            from_status: Some(expected),
            to_status: commit.plan.to(),
            reason: commit.reason,
            metadata: commit.metadata,
            changed_by: commit.changed_by,
            created_at: commit.at,
            sequence: sequence as u64,
        };

        Ok(TransitionReceipt { invoice, entry })
    }
}

#[async_trait]
impl LineItemStore for PostgresBillingStore {
    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn find_active_line_items(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Vec<LineItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LINE_ITEM_COLUMNS}
            FROM invoice_line_items
            WHERE invoice_id = $1 AND deleted_at IS NULL
            ORDER BY line_order ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(*invoice_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_active_line_items", e))?;
        rows.iter().map(line_item_from_row).collect()
    }

    async fn get_line_item(&self, id: LineItemId) -> Result<Option<LineItem>, StoreError> {
        let sql = format!("SELECT {LINE_ITEM_COLUMNS} FROM invoice_line_items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_line_item", e))?;
        row.as_ref().map(line_item_from_row).transpose()
    }

    async fn next_line_order(&self, invoice_id: InvoiceId) -> Result<u32, StoreError> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(line_order) FROM invoice_line_items WHERE invoice_id = $1")
                .bind(*invoice_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("next_line_order", e))?;
        match max {
            Some(max) => u32::try_from(max + 1)
                .map_err(|_| StoreError::Corrupt(format!("negative line_order {max}"))),
            None => Ok(0),
        }
    }

    #[instrument(skip(self, write), fields(line_item_id = %write.item().id()), err)]
    async fn write_line_item(&self, write: LineItemWrite) -> Result<Invoice, StoreError> {
        let item = write.item();
        let invoice_id = item.invoice_id();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        lock_invoice(&mut tx, invoice_id).await?;
        match &write {
            LineItemWrite::Insert(item) => insert_line_item_row(&mut tx, item).await?,
            LineItemWrite::Update(item) => update_line_item_row(&mut tx, item).await?,
        }
        let invoice = store_totals(&mut tx, invoice_id, item.updated_at()).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn recompute_totals(
        &self,
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<Invoice, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        lock_invoice(&mut tx, invoice_id).await?;
        let invoice = store_totals(&mut tx, invoice_id, at).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(invoice)
    }
}

/// Take the invoice row lock for the rest of the transaction.
async fn lock_invoice(conn: &mut PgConnection, invoice_id: InvoiceId) -> Result<(), StoreError> {
    let locked: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM invoices WHERE id = $1 FOR UPDATE")
            .bind(*invoice_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("lock_invoice", e))?;
    match locked {
        Some(_) => Ok(()),
        None => Err(StoreError::NotFound(format!("invoice {invoice_id}"))),
    }
}

async fn insert_line_item_row(conn: &mut PgConnection, item: &LineItem) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO invoice_line_items (
            id, invoice_id, description, quantity, unit_price, tax_rate, tax_included,
            amount, tax_amount, total, line_order, metadata, created_at, updated_at, deleted_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(*item.id().as_uuid())
    .bind(*item.invoice_id().as_uuid())
    .bind(item.description())
    .bind(item.quantity())
    .bind(item.unit_price())
    .bind(item.tax_rate())
    .bind(item.tax_included())
    .bind(item.amount())
    .bind(item.tax_amount())
    .bind(item.total())
    .bind(line_order_column(item.line_order())?)
    .bind(Json(item.metadata()))
    .bind(item.created_at())
    .bind(item.updated_at())
    .bind(item.deleted_at())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_line_item", e))?;
    Ok(())
}

async fn update_line_item_row(conn: &mut PgConnection, item: &LineItem) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE invoice_line_items
        SET description = $3, quantity = $4, unit_price = $5, tax_rate = $6,
            tax_included = $7, amount = $8, tax_amount = $9, total = $10,
            metadata = $11, updated_at = $12, deleted_at = $13
        WHERE id = $1 AND invoice_id = $2
        "#,
    )
    .bind(*item.id().as_uuid())
    .bind(*item.invoice_id().as_uuid())
    .bind(item.description())
    .bind(item.quantity())
    .bind(item.unit_price())
    .bind(item.tax_rate())
    .bind(item.tax_included())
    .bind(item.amount())
    .bind(item.tax_amount())
    .bind(item.total())
    .bind(Json(item.metadata()))
    .bind(item.updated_at())
    .bind(item.deleted_at())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_line_item", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("line item {}", item.id())));
    }
    Ok(())
}

/// Recompute totals from the active rows visible to this transaction and
/// write them to the (already locked) invoice row.
async fn store_totals(
    conn: &mut PgConnection,
    invoice_id: InvoiceId,
    at: DateTime<Utc>,
) -> Result<Invoice, StoreError> {
    let sql = format!(
        r#"
        SELECT {LINE_ITEM_COLUMNS}
        FROM invoice_line_items
        WHERE invoice_id = $1 AND deleted_at IS NULL
        ORDER BY line_order ASC
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(*invoice_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_line_items", e))?;
    let items = rows
        .iter()
        .map(line_item_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    let totals = calculate_invoice_totals(&items).map_err(StoreError::invalid)?;

    let sql = format!(
        r#"
        UPDATE invoices
        SET subtotal_amount = $2, tax_amount = $3, total_amount = $4, updated_at = $5
        WHERE id = $1
        RETURNING {INVOICE_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(*invoice_id.as_uuid())
        .bind(totals.subtotal_amount)
        .bind(totals.total_tax_amount)
        .bind(totals.total_amount)
        .bind(at)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("store_totals", e))?;
    invoice_from_row(&row)
}

#[async_trait]
impl StatusHistoryStore for PostgresBillingStore {
    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn history_for(
        &self,
        invoice_id: InvoiceId,
        query: HistoryQuery,
    ) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let query = query.normalized();
        let direction = match query.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM invoice_status_history
            WHERE invoice_id = $1
            ORDER BY created_at {direction}, sequence {direction}
            LIMIT $2 OFFSET $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(*invoice_id.as_uuid())
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("history_for", e))?;
        rows.iter().map(history_from_row).collect()
    }

    async fn count_history(&self, invoice_id: InvoiceId) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM invoice_status_history WHERE invoice_id = $1")
                .bind(*invoice_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_history", e))?;
        Ok(count.max(0) as u64)
    }

    async fn has_been_in_status(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM invoice_status_history WHERE invoice_id = $1 AND to_status = $2)",
        )
        .bind(*invoice_id.as_uuid())
        .bind(status.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_been_in_status", e))
    }

    async fn last_transition_to(
        &self,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<Option<StatusHistoryEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM invoice_status_history
            WHERE invoice_id = $1 AND to_status = $2
            ORDER BY created_at DESC, sequence DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(*invoice_id.as_uuid())
            .bind(status.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("last_transition_to", e))?;
        row.as_ref().map(history_from_row).transpose()
    }
}

fn line_order_column(order: u32) -> Result<i32, StoreError> {
    i32::try_from(order).map_err(|_| StoreError::Backend(format!("line_order {order} out of range")))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {name}: {e}")))
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, StoreError> {
    let status: String = column(row, "status")?;
    Ok(Invoice::restore(InvoiceRecord {
        id: InvoiceId::from_uuid(column(row, "id")?),
        invoice_number: column(row, "invoice_number")?,
        client_id: column::<Option<Uuid>>(row, "client_id")?.map(ClientId::from_uuid),
        status: status.parse()?,
        invoice_date: column::<NaiveDate>(row, "invoice_date")?,
        due_date: column::<NaiveDate>(row, "due_date")?,
        currency: column(row, "currency")?,
        notes: column(row, "notes")?,
        sent_at: column(row, "sent_at")?,
        paid_at: column(row, "paid_at")?,
        subtotal_amount: column::<Decimal>(row, "subtotal_amount")?,
        tax_amount: column::<Decimal>(row, "tax_amount")?,
        total_amount: column::<Decimal>(row, "total_amount")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    }))
}

fn line_item_from_row(row: &PgRow) -> Result<LineItem, StoreError> {
    let line_order: i32 = column(row, "line_order")?;
    let Json(metadata) = column::<Json<Metadata>>(row, "metadata")?;
    LineItem::restore(LineItemRecord {
        id: LineItemId::from_uuid(column(row, "id")?),
        invoice_id: InvoiceId::from_uuid(column(row, "invoice_id")?),
        description: column(row, "description")?,
        quantity: column::<Decimal>(row, "quantity")?,
        unit_price: column::<Decimal>(row, "unit_price")?,
        tax_rate: column::<Decimal>(row, "tax_rate")?,
        tax_included: column(row, "tax_included")?,
        line_order: u32::try_from(line_order)
            .map_err(|_| StoreError::Corrupt(format!("negative line_order {line_order}")))?,
        metadata,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        deleted_at: column(row, "deleted_at")?,
    })
    .map_err(StoreError::from)
}

fn history_from_row(row: &PgRow) -> Result<StatusHistoryEntry, StoreError> {
    let from_status: Option<String> = column(row, "from_status")?;
    let to_status: String = column(row, "to_status")?;
    let sequence: i64 = column(row, "sequence")?;
    let Json(metadata) = column::<Json<Metadata>>(row, "metadata")?;
    Ok(StatusHistoryEntry {
        id: HistoryEntryId::from_uuid(column(row, "id")?),
        invoice_id: InvoiceId::from_uuid(column(row, "invoice_id")?),
        from_status: from_status.map(|s| s.parse()).transpose()?,
        to_status: to_status.parse()?,
        reason: column(row, "reason")?,
        metadata,
        changed_by: column::<Option<Uuid>>(row, "changed_by")?.map(UserId::from_uuid),
        created_at: column(row, "created_at")?,
        sequence: sequence as u64,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("23503") => StoreError::NotFound(msg),
                _ => StoreError::Backend(msg),
            }
        }
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}
