mod common;

use common::Harness;
use epic_session::rpc::{dispatch, parse_request, Response};
use serde_json::{json, Value};

async fn call(h: &Harness, line: Value) -> Response {
    let req = parse_request(&line.to_string()).expect("well-formed request");
    dispatch(&h.svc, req).await
}

#[tokio::test]
async fn login_install_and_status_over_the_wire() {
    let h = Harness::new();

    let resp = call(&h, json!({ "id": 1, "op": "get_status" })).await;
    assert_eq!(resp.id, Some(1));
    assert!(!resp.ok);
    assert_eq!(resp.error.expect("error").kind, "auth");

    let resp = call(&h, json!({ "id": 2, "op": "login" })).await;
    assert!(resp.ok);
    let data = resp.data.expect("login data");
    assert_eq!(data["success"], true);
    assert_eq!(data["session"]["user"], "tester");
    let token = data["session"]["token"].as_str().expect("token").to_string();

    let resp = call(
        &h,
        json!({ "id": 3, "token": token, "op": "install_proton", "version": "GE-Proton9-1" }),
    )
    .await;
    assert!(resp.ok);
    let job_id = resp.data.expect("job")["job_id"]
        .as_str()
        .expect("job id")
        .to_string();

    let resp = call(&h, json!({ "id": 4, "token": token, "op": "wait_job", "job_id": job_id })).await;
    let job = resp.data.expect("finished job");
    assert_eq!(job["state"]["state"], "succeeded");
    assert_eq!(job["kind"], "install_proton");
    assert_eq!(job["key"], json!({ "type": "proton", "id": "GE-Proton9-1" }));

    let resp = call(&h, json!({ "id": 5, "token": token, "op": "list_protons" })).await;
    let protons = resp.data.expect("protons");
    assert_eq!(protons.as_array().map(Vec::len), Some(1));
    assert_eq!(protons[0]["name"], "GE-Proton9-1");

    let resp = call(&h, json!({ "id": 6, "token": token, "op": "install_proton", "version": "" })).await;
    assert_eq!(resp.error.expect("error").kind, "validation");

    let resp = call(&h, json!({ "id": 7, "token": token, "op": "get_status" })).await;
    let summary = resp.data.expect("summary");
    let summary = summary.as_str().expect("status is text");
    assert!(summary.contains("Installed Protons: 1"));
    assert!(summary.contains("Installed games: 0"));

    let resp = call(&h, json!({ "id": 8, "token": token, "op": "logout" })).await;
    assert!(resp.ok);
    let resp = call(&h, json!({ "id": 9, "token": token, "op": "list_installed" })).await;
    assert_eq!(resp.error.expect("error").kind, "auth");
}

#[tokio::test]
async fn missing_token_and_unknown_job_map_to_error_kinds() {
    let h = Harness::new();

    let resp = call(&h, json!({ "op": "jobs" })).await;
    assert_eq!(resp.id, None);
    assert_eq!(resp.error.expect("error").kind, "auth");

    let token = h.login().await;
    let resp = call(&h, json!({ "id": 1, "token": token, "op": "job", "job_id": "nope" })).await;
    assert_eq!(resp.error.expect("error").kind, "not_found");

    assert!(parse_request(r#"{"op": "self_destruct"}"#).is_err());
}

#[tokio::test]
async fn logout_without_a_token_only_succeeds_when_nobody_is_logged_in() {
    let h = Harness::new();

    let resp = call(&h, json!({ "id": 1, "op": "logout" })).await;
    assert!(resp.ok);
    assert_eq!(resp.data.expect("data")["success"], true);

    let token = h.login().await;
    let resp = call(&h, json!({ "id": 2, "op": "logout" })).await;
    assert_eq!(resp.error.expect("error").kind, "auth");

    let resp = call(&h, json!({ "id": 3, "token": token, "op": "list_installed" })).await;
    assert!(resp.ok);
}
