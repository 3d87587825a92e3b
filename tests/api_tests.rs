//! HTTP API tests against a live listener

mod common;

use common::{series, ClusterOptions, TestCluster, NOW, TENANT};
use reqwest::StatusCode;
use serde_json::{json, Value as Json};
use std::sync::Arc;
use std::time::Duration;
use strata::api::{self, ApiServerConfig, ApiState, TENANT_HEADER};
use strata::ruler::{HttpRemoteQuerier, LocalRemoteQuerier, RuleQueryFunc};
use tokio::net::TcpListener;

async fn serve(cluster: &TestCluster) -> String {
    let router = api::build_http_router(
        ApiState {
            distributor: cluster.distributor.clone(),
            querier: cluster.querier.clone(),
        },
        &ApiServerConfig::default(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn push_up(client: &reqwest::Client, base: &str) {
    let body = json!({
        "series": [series(&[("__name__", "up"), ("job", "api")], &[(NOW, 1.0)])]
    });
    let response = client
        .post(format!("{}/api/v1/push", base))
        .header(TENANT_HEADER, TENANT)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope: Json = response.json().await.unwrap();
    assert_eq!(envelope["status"], "success");
    assert_eq!(envelope["data"]["samples"], 1);
}

#[tokio::test]
async fn test_push_then_instant_query() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let base = serve(&cluster).await;
    let client = reqwest::Client::new();
    push_up(&client, &base).await;

    let time = (NOW / 1000).to_string();
    let response = client
        .get(format!("{}/api/v1/query", base))
        .header(TENANT_HEADER, TENANT)
        .query(&[("query", "up"), ("time", time.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let envelope: Json = response.json().await.unwrap();
    assert_eq!(envelope["data"]["resultType"], "vector");
    let result = envelope["data"]["result"].as_array().unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["metric"]["job"], "api");
    assert_eq!(result[0]["value"][1], "1");
}

#[tokio::test]
async fn test_requests_without_tenant_rejected() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let base = serve(&cluster).await;
    let response = reqwest::Client::new()
        .get(format!("{}/api/v1/query", base))
        .query(&[("query", "up")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bad_query_is_bad_data() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let base = serve(&cluster).await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/query", base))
        .header(TENANT_HEADER, TENANT)
        .form(&[("query", "sum(")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope: Json = response.json().await.unwrap();
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["errorType"], "bad_data");
}

#[tokio::test]
async fn test_ready_reports_ring_health() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let base = serve(&cluster).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let ready = client.get(format!("{}/ready", base)).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rule_queries_over_http_and_in_process_agree() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let base = serve(&cluster).await;
    push_up(&reqwest::Client::new(), &base).await;

    let remote = RuleQueryFunc::new(
        Arc::new(HttpRemoteQuerier::new(base, "", Duration::from_secs(5))),
        cluster.overrides.clone(),
        TENANT,
    );
    let local = RuleQueryFunc::new(
        Arc::new(LocalRemoteQuerier::new(cluster.querier.clone())),
        cluster.overrides.clone(),
        TENANT,
    );

    let over_http = remote.query("sum(up)", NOW).await.unwrap();
    let in_process = local.query("sum(up)", NOW).await.unwrap();
    assert_eq!(over_http.len(), 1);
    assert_eq!(over_http[0].value, 1.0);
    assert_eq!(over_http, in_process);

    let scalar = remote.query("3", NOW).await.unwrap();
    assert_eq!(scalar[0].value, 3.0);
}

#[tokio::test]
async fn test_unrepresentable_query_times_are_bad_data() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let base = serve(&cluster).await;
    let client = reqwest::Client::new();
    push_up(&client, &base).await;

    let instant = [("query", "up"), ("time", "1e30")];
    let ranges = [
        [("query", "up"), ("start", "-1e30"), ("end", "1e30"), ("step", "15")],
        [("query", "up"), ("start", "0"), ("end", "NaN"), ("step", "15")],
        [("query", "up"), ("start", "100"), ("end", "10"), ("step", "15")],
        [("query", "up"), ("start", "0"), ("end", "10"), ("step", "0")],
        [("query", "up"), ("start", "0"), ("end", "10"), ("step", "-1")],
        [("query", "up"), ("start", "0"), ("end", "10"), ("step", "1e30")],
    ];

    let mut requests = vec![client
        .get(format!("{}/api/v1/query", base))
        .query(&instant)];
    for params in &ranges {
        requests.push(client.get(format!("{}/api/v1/query_range", base)).query(params));
    }
    for request in requests {
        let response = request.header(TENANT_HEADER, TENANT).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let envelope: Json = response.json().await.unwrap();
        assert_eq!(envelope["errorType"], "bad_data");
    }

    // The server is still answering after the rejected requests
    let response = client
        .get(format!("{}/api/v1/query_range", base))
        .header(TENANT_HEADER, TENANT)
        .query(&[("query", "up"), ("start", "0"), ("end", "60"), ("step", "15")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
