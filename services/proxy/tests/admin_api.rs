mod harness;

use harness::ProxyHandle;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

async fn setup() -> (ProxyHandle, Client, String) {
    let proxy = ProxyHandle::new();
    let base = proxy.spawn_admin().await.unwrap();
    (proxy, Client::new(), base)
}

async fn post(client: &Client, url: String, body: Value) -> (StatusCode, Value) {
    let resp = client.post(url).json(&body).send().await.unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap())
}

async fn fetch(client: &Client, url: String) -> (StatusCode, Value) {
    let resp = client.get(url).send().await.unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap())
}

/// Cluster `echo`, route `r`, rule `all` and rulelist `main`.
async fn populate(client: &Client, base: &str) {
    let (status, _) = post(
        client,
        format!("{base}/clusters"),
        json!({"name": "echo", "spec": {"protocol": "echo"}}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = post(
        client,
        format!("{base}/routes"),
        json!({"name": "r", "destination": "echo"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, rule) = post(
        client,
        format!("{base}/rules"),
        json!({"name": "all", "match": "*", "action": {"route": "r"}}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(rule["stats"]["total_applied"], json!(0));

    let (status, list) = post(
        client,
        format!("{base}/rulelists"),
        json!({"name": "main", "rules": ["all"]}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(list["rules"], json!(["all"]));
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (_proxy, client, base) = setup().await;
    let root = base.trim_end_matches(mp_proxy::admin::http::API_PREFIX);
    let (status, body) = fetch(&client, format!("{root}/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn crud_and_recursive_views() {
    let (_proxy, client, base) = setup().await;
    populate(&client, &base).await;

    let (status, list) = fetch(&client, format!("{base}/rulelists/main?recursive=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["rules"][0]["name"], json!("all"));
    assert_eq!(list["rules"][0]["action"], json!({"route": "r"}));

    let (_, route) = fetch(&client, format!("{base}/routes/r")).await;
    assert_eq!(route["destination"], json!("echo"));
    let (_, route) = fetch(&client, format!("{base}/routes/r?recursive=true")).await;
    assert_eq!(route["destination"]["name"], json!("echo"));

    let (status, items) = fetch(&client, format!("{base}/rules")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(items["items"].as_array().unwrap().len(), 1);

    let resp = client
        .put(format!("{base}/rules/all"))
        .json(&json!({"match": {"op": "test", "path": "/listener", "value": "web"}, "action": {"route": "r"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let rule: Value = resp.json().await.unwrap();
    assert_eq!(rule["match"]["value"], json!("web"));

    let dump = fetch(&client, base.clone()).await.1;
    assert_eq!(dump["rulelists"][0]["name"], json!("main"));
    assert_eq!(dump["clusters"][0]["name"], json!("echo"));
    assert_eq!(dump["stats"]["sessions_live"], json!(0));
}

#[tokio::test]
async fn missing_entity_is_problem_json() {
    let (_proxy, client, base) = setup().await;

    let resp = client.get(format!("{base}/rules/nope")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert_eq!(content_type, "application/problem+json");
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["status"], json!(404));
    assert_eq!(problem["code"], json!("not_found"));
}

#[tokio::test]
async fn conflicts_are_409() {
    let (_proxy, client, base) = setup().await;
    populate(&client, &base).await;

    let (status, problem) = post(
        &client,
        format!("{base}/rules"),
        json!({"name": "all", "match": "*", "action": {"route": "r"}}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["code"], json!("already_exists"));

    let resp = client.delete(format!("{base}/rules/all")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], json!("in_use"));

    let resp = client.delete(format!("{base}/clusters/echo")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // unreferenced once the route goes
    let resp = client.delete(format!("{base}/routes/r")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = client.delete(format!("{base}/clusters/echo")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn dangling_reference_is_422() {
    let (_proxy, client, base) = setup().await;

    let (status, problem) = post(
        &client,
        format!("{base}/rulelists"),
        json!({"name": "main", "rules": ["ghost"]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(problem["code"], json!("invalid"));

    let (status, _) = post(&client, format!("{base}/rules"), json!({"name": 7})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn positional_rulelist_entries() {
    let (_proxy, client, base) = setup().await;
    populate(&client, &base).await;

    let (status, list) = post(
        &client,
        format!("{base}/rulelists/main/rules/0"),
        json!({"name": "web", "match": {"op": "test", "path": "/TCP/dst_port", "value": 80}, "action": {"route": "r"}}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(list["rules"].as_array().unwrap().len(), 2);
    assert_eq!(list["rules"][0]["name"], json!("web"));
    assert_eq!(list["rules"][1], json!("all"));

    let (status, entry) = fetch(&client, format!("{base}/rulelists/main/rules/1?recursive=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["name"], json!("all"));

    let (status, problem) = fetch(&client, format!("{base}/rulelists/main/rules/9")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], json!("position_out_of_range"));

    for bad in ["abc", "-1"] {
        let resp = client
            .get(format!("{base}/rulelists/main/rules/{bad}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()["content-type"], "application/problem+json");
        let problem: Value = resp.json().await.unwrap();
        assert_eq!(problem["code"], json!("bad_request"));
    }
    let resp = client
        .delete(format!("{base}/rulelists/main/rules/first"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers()["content-type"], "application/problem+json");

    let resp = client
        .delete(format!("{base}/rulelists/main/rules/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let removed: Value = resp.json().await.unwrap();
    assert_eq!(removed["name"], json!("web"));

    let (_, list) = fetch(&client, format!("{base}/rulelists/main")).await;
    assert_eq!(list["rules"], json!(["all"]));
}

#[tokio::test]
async fn path_endpoints_read_and_write() {
    let (_proxy, client, base) = setup().await;
    populate(&client, &base).await;

    let (status, value) = fetch(&client, format!("{base}/rules/all/path/action/route")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, json!("r"));

    let resp = client
        .put(format!("{base}/rules/all/path/action/set/tier"))
        .json(&json!("gold"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let rule: Value = resp.json().await.unwrap();
    assert_eq!(rule["action"]["set"]["tier"], json!("gold"));

    let (status, problem) = fetch(&client, format!("{base}/routes/r/path/no/such")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["code"], json!("path_not_found"));

    let resp = client
        .put(format!("{base}/rules/all/path/name"))
        .json(&json!("renamed"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp = client
        .delete(format!("{base}/rules/all/path/action/set"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let rule: Value = resp.json().await.unwrap();
    assert_eq!(rule["action"], json!({"route": "r"}));
}
