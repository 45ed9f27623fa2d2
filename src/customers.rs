//! Customer resolution by normalised phone number.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::{self, DbState};
use crate::error::{CoreResult, ValidationError};
use crate::models::{normalize_phone, Customer, CustomerRef};
use crate::remote::{with_timeout, NaturalKey, RemoteStore, TABLE_CUSTOMERS};

fn map_customer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        phone: row.get(1)?,
        name: row.get(2)?,
        remote_id: row.get(3)?,
    })
}

pub(crate) fn get(conn: &Connection, id: &str) -> CoreResult<Option<Customer>> {
    Ok(conn
        .query_row(
            "SELECT id, phone, name, remote_id FROM customers WHERE id = ?1",
            params![id],
            map_customer,
        )
        .optional()?)
}

pub(crate) fn find_by_phone(conn: &Connection, phone: &str) -> CoreResult<Option<Customer>> {
    Ok(conn
        .query_row(
            "SELECT id, phone, name, remote_id FROM customers WHERE phone = ?1",
            params![normalize_phone(phone)],
            map_customer,
        )
        .optional()?)
}

/// Find the customer for `reference`, creating the local row on first sight.
/// A name supplied for a customer without one is stored.
pub(crate) fn resolve_local(
    conn: &Connection,
    reference: &CustomerRef,
    now: DateTime<Utc>,
) -> CoreResult<Customer> {
    let phone = normalize_phone(&reference.phone);
    if phone.is_empty() {
        return Err(ValidationError::MissingCustomerPhone.into());
    }
    let name = reference
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    if let Some(mut existing) = find_by_phone(conn, &phone)? {
        if existing.name.is_none() {
            if let Some(name) = name {
                conn.execute(
                    "UPDATE customers SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![name, db::ts(now), existing.id],
                )?;
                existing.name = Some(name.to_string());
            }
        }
        return Ok(existing);
    }

    let customer = Customer {
        id: uuid::Uuid::new_v4().to_string(),
        phone,
        name: name.map(str::to_string),
        remote_id: None,
    };
    conn.execute(
        "INSERT INTO customers (id, phone, name, remote_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
        params![customer.id, customer.phone, customer.name, db::ts(now)],
    )?;
    info!(customer_id = %customer.id, "Created local customer");
    Ok(customer)
}

pub(crate) fn set_remote_id(conn: &Connection, id: &str, remote_id: &str) -> CoreResult<()> {
    conn.execute(
        "UPDATE customers SET remote_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![remote_id, db::ts(Utc::now()), id],
    )?;
    Ok(())
}

/// Remote id of `customer`, upserting it by phone number if the remote store
/// has not acknowledged it yet.
pub(crate) async fn ensure_remote(
    db: &DbState,
    remote: &dyn RemoteStore,
    timeout: Duration,
    customer: &Customer,
) -> CoreResult<String> {
    if let Some(remote_id) = &customer.remote_id {
        return Ok(remote_id.clone());
    }

    let fields = json!({
        "phone": customer.phone,
        "name": customer.name,
        "local_id": customer.id,
    });
    let op_id = format!("customer-upsert:{}", customer.id);
    let ack = with_timeout(
        timeout,
        remote.upsert_by_natural_key(
            TABLE_CUSTOMERS,
            &NaturalKey::new("phone", customer.phone.clone()),
            fields,
            &op_id,
        ),
    )
    .await?;

    let conn = db.conn.lock()?;
    set_remote_id(&conn, &customer.id, &ack.record_id)?;
    debug!(customer_id = %customer.id, remote_id = %ack.record_id, "Customer resolved remotely");
    Ok(ack.record_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;

    #[test]
    fn test_resolve_by_normalised_phone() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        let now = Utc::now();

        let first = resolve_local(&conn, &CustomerRef::new("+30 555-0100", None), now).unwrap();
        let second =
            resolve_local(&conn, &CustomerRef::new("305550100", Some("Maria")), now).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.phone, "305550100");
        assert_eq!(second.name.as_deref(), Some("Maria"));
    }

    #[test]
    fn test_phone_is_required() {
        let state = db::open_in_memory().unwrap();
        let conn = state.conn.lock().unwrap();
        let err = resolve_local(&conn, &CustomerRef::new(" - ", None), Utc::now()).unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_ensure_remote_stores_remote_id_once() {
        let state = db::open_in_memory().unwrap();
        let remote = MemoryRemoteStore::new();
        let customer = {
            let conn = state.conn.lock().unwrap();
            resolve_local(&conn, &CustomerRef::new("5550100", Some("Ana")), Utc::now()).unwrap()
        };

        let remote_id = ensure_remote(&state, &remote, Duration::from_secs(1), &customer)
            .await
            .unwrap();

        let conn = state.conn.lock().unwrap();
        let stored = get(&conn, &customer.id).unwrap().unwrap();
        assert_eq!(stored.remote_id.as_deref(), Some(remote_id.as_str()));
        assert_eq!(remote.rows(TABLE_CUSTOMERS).len(), 1);
    }
}
