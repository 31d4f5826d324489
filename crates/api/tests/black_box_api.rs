use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{Value, json};

use billflow_api::app::{AppServices, build_app};
use billflow_core::{FixedClock, UserId};

struct TestServer {
    base_url: String,
    clock: Arc<FixedClock>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over an in-memory store, bound to an ephemeral port.
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
        ));
        let services = Arc::new(AppServices::in_memory(clock.clone()));
        let app = build_app(services);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            clock,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn money(v: &Value) -> Decimal {
    Decimal::from_str(v.as_str().unwrap_or_else(|| panic!("expected decimal string, got {v}")))
        .unwrap()
}

async fn create_invoice(client: &reqwest::Client, srv: &TestServer, number: &str, due: &str) -> String {
    let res = client
        .post(srv.url("/invoices"))
        .json(&json!({
            "invoice_number": number,
            "invoice_date": "2026-01-15",
            "due_date": due,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "DRAFT");
    body["id"].as_str().unwrap().to_string()
}

async fn add_line(
    client: &reqwest::Client,
    srv: &TestServer,
    invoice_id: &str,
    quantity: &str,
    unit_price: &str,
) -> Value {
    let res = client
        .post(srv.url(&format!("/invoices/{invoice_id}/line-items")))
        .json(&json!({
            "description": "Consulting",
            "quantity": quantity,
            "unit_price": unit_price,
            "tax_rate": "20",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn change_status(
    client: &reqwest::Client,
    srv: &TestServer,
    invoice_id: &str,
    body: Value,
) -> reqwest::Response {
    client
        .post(srv.url(&format!("/invoices/{invoice_id}/status")))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn invoice_lifecycle_over_http() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_invoice(&client, &srv, "INV-HTTP-1", "2026-02-15").await;

    add_line(&client, &srv, &id, "5", "100").await;
    let change = add_line(&client, &srv, &id, "3", "200").await;
    assert_eq!(change["line_item"]["line_order"], 1);
    assert_eq!(money(&change["totals"]["subtotal_amount"]), Decimal::from(1100));
    assert_eq!(money(&change["totals"]["total_tax_amount"]), Decimal::from(220));
    assert_eq!(money(&change["totals"]["total_amount"]), Decimal::from(1320));

    let user = UserId::new();
    let res = client
        .post(srv.url(&format!("/invoices/{id}/status")))
        .header("x-user-id", user.to_string())
        .json(&json!({ "status": "SENT", "reason": "Emailed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["invoice"]["status"], "SENT");
    assert!(body["invoice"]["sent_at"].is_string());
    assert_eq!(body["history_entry"]["from_status"], "DRAFT");
    assert_eq!(body["history_entry"]["changed_by"], user.to_string());
    assert_eq!(body["allowed_next_statuses"], json!(["PAID", "OVERDUE", "CANCELLED"]));

    let res = change_status(&client, &srv, &id, json!({ "status": "paid" })).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert!(body["invoice"]["paid_at"].is_string());

    let res = client
        .get(srv.url(&format!("/invoices/{id}/history?order=asc")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["current_status"], "PAID");
    assert_eq!(page["pagination"]["total"], 2);
    let to: Vec<&str> = page["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["to_status"].as_str().unwrap())
        .collect();
    assert_eq!(to, vec!["SENT", "PAID"]);

    let res = client.get(srv.url(&format!("/invoices/{id}"))).send().await.unwrap();
    let invoice: Value = res.json().await.unwrap();
    assert_eq!(invoice["status"], "PAID");
    assert_eq!(invoice["is_overdue"], false);
    assert_eq!(invoice["allowed_next_statuses"], json!(["CANCELLED"]));
}

#[tokio::test]
async fn workflow_rejections_map_to_422() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_invoice(&client, &srv, "INV-HTTP-2", "2026-02-15").await;

    let res = change_status(&client, &srv, &id, json!({ "status": "SENT" })).await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "TRANSITION_NOT_ALLOWED");
    assert_eq!(body["validation_errors"][0]["code"], "EMPTY_INVOICE");

    let res = change_status(&client, &srv, &id, json!({ "status": "PAID" })).await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "ILLEGAL_TRANSITION");
    assert_eq!(body["current_status"], "DRAFT");
    assert_eq!(body["requested_status"], "PAID");

    let res = change_status(&client, &srv, &id, json!({ "status": "ARCHIVED" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(srv.url(&format!("/invoices/{id}/history")))
        .send()
        .await
        .unwrap();
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["pagination"]["total"], 0);
}

#[tokio::test]
async fn invalid_line_items_are_value_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_invoice(&client, &srv, "INV-HTTP-3", "2026-02-15").await;

    let res = client
        .post(srv.url(&format!("/invoices/{id}/line-items")))
        .json(&json!({
            "description": "Broken",
            "quantity": "-1",
            "unit_price": "10",
            "tax_rate": "20",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "VALUE_ERROR");

    // Values whose product overflows the decimal range are rejected, and the
    // server keeps answering afterwards.
    for (quantity, unit_price) in [("100000000000000", "100000000000000"), ("1.23456", "10")] {
        let res = client
            .post(srv.url(&format!("/invoices/{id}/line-items")))
            .json(&json!({
                "description": "Too big",
                "quantity": quantity,
                "unit_price": unit_price,
                "tax_rate": "20",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"], "VALUE_ERROR");
    }

    let res = client
        .get(srv.url(&format!("/invoices/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(money(&body["total_amount"]), Decimal::ZERO);
}

#[tokio::test]
async fn line_item_edit_and_delete_recompute_totals() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_invoice(&client, &srv, "INV-HTTP-4", "2026-02-15").await;

    let first = add_line(&client, &srv, &id, "10", "100").await;
    let item_id = first["line_item"]["id"].as_str().unwrap().to_string();
    add_line(&client, &srv, &id, "3", "33.33").await;

    let res = client
        .put(srv.url(&format!("/invoices/{id}/line-items/{item_id}")))
        .json(&json!({ "tax_included": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(money(&body["line_item"]["tax_amount"]), Decimal::ZERO);
    assert_eq!(money(&body["totals"]["total_amount"]), Decimal::from_str("1119.99").unwrap());

    let res = client
        .delete(srv.url(&format!("/invoices/{id}/line-items/{item_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(money(&body["totals"]["total_amount"]), Decimal::from_str("119.99").unwrap());

    let res = client
        .get(srv.url(&format!("/invoices/{id}/line-items")))
        .send()
        .await
        .unwrap();
    let items: Value = res.json().await.unwrap();
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0]["line_order"], 1);

    let res = client
        .post(srv.url(&format!("/invoices/{id}/recalculate")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let totals: Value = res.json().await.unwrap();
    assert_eq!(money(&totals["subtotal_amount"]), Decimal::from_str("99.99").unwrap());
}

#[tokio::test]
async fn admin_sweep_marks_overdue_invoices() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_invoice(&client, &srv, "INV-HTTP-5", "2026-01-20").await;
    add_line(&client, &srv, &id, "1", "10").await;
    let res = change_status(&client, &srv, &id, json!({ "status": "SENT" })).await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.post(srv.url("/admin/overdue-sweep")).send().await.unwrap();
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["candidates"], 0);

    srv.clock.set(
        NaiveDate::from_ymd_opt(2026, 1, 21)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap()
            .and_utc(),
    );
    let res = client.post(srv.url("/admin/overdue-sweep")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["candidates"], 1);
    assert_eq!(report["updated_count"], 1);

    let res = client
        .get(srv.url("/invoices?status=OVERDUE"))
        .send()
        .await
        .unwrap();
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["is_overdue"], true);
}

#[tokio::test]
async fn malformed_ids_and_missing_invoices() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/invoices/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let missing = uuid::Uuid::now_v7();
    let res = client
        .get(srv.url(&format!("/invoices/{missing}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "NOT_FOUND");

    let res = client
        .get(srv.url("/invoices"))
        .header("x-user-id", "nobody")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_invoice_number_conflicts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    create_invoice(&client, &srv, "INV-HTTP-6", "2026-02-15").await;

    let res = client
        .post(srv.url("/invoices"))
        .json(&json!({
            "invoice_number": "INV-HTTP-6",
            "invoice_date": "2026-01-15",
            "due_date": "2026-02-15",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}
