use axum::body::{to_bytes, Body};
use axum::http::{header::CONTENT_TYPE, header::LOCATION, Request, StatusCode};
use axum::Router;
use checkout_service::repo::{Order, OrderStatus, Shipment, ShipmentStatus};
use checkout_service::{router, AppState, CheckoutStore, InMemoryCheckoutStore, MerchantCredentials, PaymentSettings, ServiceConfig, StaticCredentialSource};
use httpmock::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceExt;

const HASH_KEY: &str = "XBERn1YOvpM9nfZc";
const HASH_IV: &str = "h1ONHk4P4yqbl5LK";
const ORDER_ID: &str = "SOM-20250101-0001";
const TRADE_NO: &str = "SOM202501010001";

async fn app(gateway_base: Option<String>) -> (Router, Arc<InMemoryCheckoutStore>) {
    let store = Arc::new(InMemoryCheckoutStore::new());
    store.insert_order(Order::new(ORDER_ID, OrderStatus::Paid)).await;
    store.insert_shipment(Shipment::new("ship-1", ORDER_ID, "ecpay", TRADE_NO)).await;

    let logistics = MerchantCredentials::new("2000933", HASH_KEY, HASH_IV, true);
    let credentials = StaticCredentialSource::new(PaymentSettings::default(), logistics);
    let config = ServiceConfig {
        public_base_url: "https://shop.example".into(),
        store_selection_client_url: "https://shop.example/checkout/store?step=2".into(),
        logistics_base_url: gateway_base,
        ..ServiceConfig::default()
    };
    let state = AppState::new(store.clone(), Arc::new(credentials), config).unwrap();
    (router(state), store)
}

fn signed(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut fields: BTreeMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let digest = common_crypto::sign(&fields, HASH_KEY, HASH_IV);
    fields.insert("CheckMacValue".into(), digest);
    fields
}

fn form_post(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn status_callback(code: &str, message: &str) -> String {
    let fields = signed(&[
        ("MerchantID", "2000933"),
        ("MerchantTradeNo", TRADE_NO),
        ("RtnCode", code),
        ("RtnMsg", message),
        ("AllPayLogisticsID", "1718546"),
        ("LogisticsSubType", "UNIMARTC2C"),
        ("GoodsAmount", "1200"),
        ("UpdateStatusDate", "2025/01/05 15:20:00"),
    ]);
    serde_urlencoded::to_string(&fields).unwrap()
}

#[tokio::test]
async fn picked_up_callback_delivers_shipment_and_order() {
    let (app, store) = app(None).await;
    let resp = app
        .oneshot(form_post("/webhooks/ecpay/logistics", status_callback("3042", "Picked up")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "1|OK");

    let shipment = store.shipment("ship-1").await.unwrap();
    assert_eq!(shipment.shipment_status, ShipmentStatus::Delivered);
    let delivered_at = shipment.delivered_at.unwrap();
    assert_eq!(delivered_at.to_rfc3339(), "2025-01-05T07:20:00+00:00");
    assert_eq!(shipment.status_updates.last().unwrap().description, "[3042] Picked up");

    let order = store.find_order(ORDER_ID).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Delivered);
    assert_eq!(order.timeline.last().unwrap().status, OrderStatus::Delivered);
}

#[tokio::test]
async fn arrival_callback_notes_order_timeline() {
    let (app, store) = app(None).await;
    let resp = app
        .oneshot(form_post("/webhooks/ecpay/logistics", status_callback("3024", "Arrived at store")))
        .await
        .unwrap();
    assert_eq!(body_text(resp).await, "1|OK");

    assert_eq!(store.shipment("ship-1").await.unwrap().shipment_status, ShipmentStatus::OutForDelivery);
    let order = store.find_order(ORDER_ID).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.timeline.last().unwrap().note, "Package arrived at pickup point");
}

#[tokio::test]
async fn forged_logistics_callback_is_refused() {
    let (app, store) = app(None).await;
    let body = status_callback("3042", "Picked up").replace("RtnCode=3042", "RtnCode=3018");
    let resp = app.oneshot(form_post("/webhooks/ecpay/logistics", body)).await.unwrap();
    assert_eq!(body_text(resp).await, "0|CheckMacValue verify fail");
    assert_eq!(store.shipment("ship-1").await.unwrap().shipment_status, ShipmentStatus::Pending);
}

#[tokio::test]
async fn store_map_renders_gateway_form() {
    let (app, _) = app(None).await;
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/logistics/store-map?subType=FAMIC2C&tradeNo=SOM-20250101-0001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let html = body_text(resp).await;
    assert!(html.contains("logistics-stage"));
    assert!(html.contains("name=\"LogisticsSubType\" value=\"FAMIC2C\""));
    assert!(html.contains("name=\"MerchantTradeNo\" value=\"SOM202501010001\""));
}

#[tokio::test]
async fn store_map_rejects_unknown_brand() {
    let (app, _) = app(None).await;
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/logistics/store-map?subType=HILIFE&tradeNo=T1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_sub_type");
}

#[tokio::test]
async fn store_reply_redirects_with_selection() {
    let (app, _) = app(None).await;
    let body = "CVSStoreID=131386&CVSStoreName=%E5%BB%BA%E6%96%B0&CVSAddress=Taipei+Rd+1&CVSOutSide=0&LogisticsSubType=UNIMARTC2C&MerchantTradeNo=T1";
    let resp = app.oneshot(form_post("/logistics/store-reply", body.to_string())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    let location = resp.headers()[LOCATION].to_str().unwrap();
    assert!(location.starts_with("https://shop.example/checkout/store?step=2&storeId=131386"), "{location}");
    assert!(location.contains("storeName=%E5%BB%BA%E6%96%B0"));
    assert!(location.contains("address=Taipei%20Rd%201"));
    assert!(location.contains("subType=UNIMARTC2C"));
    assert!(location.contains("outside=0"));
}

#[tokio::test]
async fn create_shipment_links_logistics_refs() {
    let server = MockServer::start_async().await;
    let response = serde_urlencoded::to_string(signed(&[
        ("RtnCode", "300"),
        ("RtnMsg", "OK"),
        ("AllPayLogisticsID", "1718546"),
        ("CVSPaymentNo", "F0000032"),
        ("CVSValidationNo", "6062"),
    ]))
    .unwrap();
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/Express/Create")
                .body_contains("ServerReplyURL=https%3A%2F%2Fshop.example%2Fwebhooks%2Fecpay%2Flogistics");
            then.status(200).body(format!("1|{response}"));
        })
        .await;

    let (app, store) = app(Some(server.base_url())).await;
    let request = serde_json::json!({
        "merchantTradeNo": ORDER_ID,
        "subType": "UNIMARTC2C",
        "goodsAmount": 1200,
        "goodsName": "Ceramic mug",
        "senderName": "Shop",
        "senderCellPhone": "0912345678",
        "receiverName": "Bob",
        "receiverCellPhone": "0987654321",
        "receiverStoreId": "131386"
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/shipments")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    mock.assert_async().await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(body["logisticsId"], "1718546");
    assert_eq!(body["shipmentLinked"], true);

    let shipment = store.shipment("ship-1").await.unwrap();
    assert_eq!(shipment.logistics_id.as_deref(), Some("1718546"));
    assert_eq!(shipment.tracking_number.as_deref(), Some("F0000032"));
}

#[tokio::test]
async fn create_shipment_maps_gateway_rejection() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/Express/Create");
            then.status(200).body("RtnCode=10500040&RtnMsg=Store+closed");
        })
        .await;

    let (app, _) = app(Some(server.base_url())).await;
    let request = serde_json::json!({
        "merchantTradeNo": ORDER_ID,
        "subType": "FAMIC2C",
        "goodsAmount": 1200,
        "goodsName": "Mug",
        "senderName": "Shop",
        "senderCellPhone": "0912345678",
        "receiverName": "Bob",
        "receiverCellPhone": "0987654321",
        "receiverStoreId": "006598"
    });
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/shipments")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "gateway_rejected");
    assert!(body_text(resp).await.contains("Store closed"));
}

#[tokio::test]
async fn status_query_goes_through_gateway() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/Helper/QueryLogisticsTradeInfo/V4");
            then.status(200)
                .body("MerchantTradeNo=SOM202501010001&LogisticsStatus=3042&GoodsAmount=1200&LogisticsType=CVS_FAMIC2C");
        })
        .await;

    let (app, _) = app(Some(server.base_url())).await;
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/shipments/SOM202501010001/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(body["code"], 3042);
    assert_eq!(body["status"], "delivered");
    assert_eq!(body["subType"], "FAMIC2C");
    assert_eq!(body["amount"], 1200);
}
