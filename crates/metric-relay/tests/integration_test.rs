// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use metric_relay::delivery::PayloadEncoding;
use metric_relay::errors::DeliveryError;
use metric_relay::util::{get_hostname, make_safe_instance_string, short_hostname};
use metric_relay::{
    Config, LineSource, Pipeline, PipelineError, PipelineStats, ReqwestTransport,
};
use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(url: &str, sections: &str) -> Config {
    let mut config = Config::from_json(&format!(
        r#"{{
            "collector": {{
                "user_name": "alice",
                "license_key": "abc123",
                "project_name": "web",
                "sampling_interval": "1"
            }},
            {sections}
        }}"#
    ))
    .expect("failed to parse config");
    config.collector.url = url.to_string();
    config
}

async fn run(config: &Config, input: &'static [u8]) -> Result<PipelineStats, PipelineError> {
    let transport = ReqwestTransport::new(
        Duration::from_secs(5),
        None,
        config.collector.payload_encoding,
    )
    .expect("failed to build transport");
    let pipeline =
        Pipeline::from_config(config, Arc::new(transport)).expect("failed to build pipeline");
    pipeline
        .run(LineSource::new(input), CancellationToken::new())
        .await
}

const SCENARIO_A: &str = r#""parsing": {
        "instance_field": "tags.service_alias",
        "timestamp_field": "tags.time_bucket",
        "data_fields": ["req_count:{fields.req_count}", "svc_mean:{fields.svc_mean}"]
    }"#;

#[tokio::test]
async fn single_required_field_is_released_and_posted() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/customprojectrawdata")
        .match_header("content-type", "application/x-www-form-urlencoded")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("licenseKey".into(), "abc123".into()),
            Matcher::UrlEncoded("userName".into(), "alice".into()),
            Matcher::UrlEncoded("projectName".into(), "web".into()),
            Matcher::UrlEncoded("agentType".into(), "CUSTOM".into()),
            Matcher::UrlEncoded("samplingInterval".into(), "60".into()),
            Matcher::UrlEncoded(
                "metricData".into(),
                r#"[{"timestamp":"1704067200000","req_count[svc1]":"5"}]"#.into(),
            ),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = config(
        &server.url(),
        &format!(r#"{SCENARIO_A}, "join": {{"required_fields": "req_count"}}"#),
    );
    let input: &[u8] = br#"{"tags":{"time_bucket":"2024-01-01T00:00:00Z","service_alias":"svc1"},"fields":{"req_count":5}}
"#;

    let stats = run(&config, input).await.expect("pipeline failed");
    assert_eq!(stats.rows, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn partial_updates_are_merged_into_one_row() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/customprojectrawdata")
        .match_body(Matcher::UrlEncoded(
            "metricData".into(),
            r#"[{"timestamp":"1704067200000","req_count[svc1]":"5","svc_mean[svc1]":"1.5"}]"#
                .into(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = config(
        &server.url(),
        &format!(r#"{SCENARIO_A}, "join": {{"required_fields": "req_count,svc_mean"}}"#),
    );
    let input: &[u8] = br#"{"tags":{"time_bucket":"2024-01-01T00:00:00Z","service_alias":"svc1"},"fields":{"req_count":5}}
{"tags":{"time_bucket":"2024-01-01T00:00:00Z","service_alias":"svc1"},"fields":{"svc_mean":1.5}}
"#;

    let stats = run(&config, input).await.expect("pipeline failed");
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.rows, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn csv_row_becomes_one_flat_record() {
    let instance = make_safe_instance_string(short_hostname(&get_hostname()), None);
    let expected = json!([{
        "timestamp": "1700000000000",
        (format!("cpu[{instance}]")): "10",
        (format!("mem[{instance}]")): "20",
    }]);

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/customprojectrawdata")
        .match_body(Matcher::UrlEncoded("metricData".into(), expected.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = config(
        &server.url(),
        r#""parsing": {"data_format": "CSV", "csv_field_names": "timestamp,cpu,mem"}"#,
    );
    let input: &[u8] = b"timestamp,cpu,mem\n1700000000,10,20\n";

    let stats = run(&config, input).await.expect("pipeline failed");
    assert_eq!(stats.rows, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn json_encoding_posts_a_json_body() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/customprojectrawdata")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "licenseKey": "abc123",
            "instanceName": short_hostname(&get_hostname()),
            "agentType": "CUSTOM",
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let mut config = config(&server.url(), r#""parsing": {"instance_field": "host"}"#);
    config.collector.payload_encoding = PayloadEncoding::Json;
    let input: &[u8] = b"{\"host\": \"web\", \"timestamp\": \"1700000000\", \"cpu\": 1}\n";

    run(&config, input).await.expect("pipeline failed");
    mock.assert_async().await;
}

#[tokio::test]
async fn failing_collector_exhausts_retries() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/customprojectrawdata")
        .with_status(500)
        .with_body("Internal Server Error")
        .expect(3)
        .create_async()
        .await;

    let mut config = config(&server.url(), r#""parsing": {"instance_field": "host"}"#);
    config.collector.retry_backoff_secs = 0;
    let input: &[u8] = b"{\"host\": \"web\", \"timestamp\": \"1700000000\", \"cpu\": 1}\n";

    let err = run(&config, input).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Delivery(DeliveryError::RetriesExhausted { attempts: 3 })
    ));
    mock.assert_async().await;
}
