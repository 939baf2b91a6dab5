use regla_core::{AzureConfig, EmbeddingConfig, OpenAiConfig, ProviderKind};
use regla_embed::{select_provider, EmbeddingProvider, ProbeStatus};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Answers with one embedding per input, in reverse index order.
struct EchoEmbeddings;

impl Respond for EchoEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let n = body["input"].as_array().map(Vec::len).unwrap_or(0);
        let data: Vec<_> = (0..n)
            .rev()
            .map(|i| json!({"index": i, "embedding": [1.0, i as f32, 0.0]}))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }
}

fn unusable_azure() -> AzureConfig {
    AzureConfig {
        endpoint: Some("not-a-url".into()),
        api_key: Some("0123456789abcdef".into()),
        deployment: Some("embed".into()),
        ..AzureConfig::default()
    }
}

fn azure_at(server: &MockServer) -> AzureConfig {
    AzureConfig {
        endpoint: Some(server.uri()),
        api_key: Some("azure-key-0123456789".into()),
        deployment: Some("embed-small".into()),
        api_version: "2024-02-01".into(),
    }
}

fn openai_at(server: &MockServer) -> OpenAiConfig {
    OpenAiConfig {
        api_key: Some("sk-test-0123456789".into()),
        base_url: server.uri(),
        model: "text-embedding-3-small".into(),
    }
}

fn config(azure: AzureConfig, openai: OpenAiConfig) -> EmbeddingConfig {
    EmbeddingConfig {
        chain: vec![ProviderKind::Azure, ProviderKind::OpenAi],
        timeout_secs: 1,
        azure,
        openai,
        ..EmbeddingConfig::default()
    }
}

#[tokio::test]
async fn azure_selected_when_probe_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/embed-small/embeddings"))
        .and(query_param("api-version", "2024-02-01"))
        .and(header("api-key", "azure-key-0123456789"))
        .respond_with(EchoEmbeddings)
        .expect(1)
        .mount(&server)
        .await;

    let selection = select_provider(&config(azure_at(&server), OpenAiConfig::default())).await;

    assert_eq!(selection.provider.kind(), ProviderKind::Azure);
    assert_eq!(selection.provider.dimension(), 3);
    assert!(selection.provider.is_available());
    assert_eq!(selection.outcomes.len(), 1);
}

#[tokio::test]
async fn falls_back_to_openai_when_azure_probe_fails() {
    let azure = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("deployment not found"))
        .mount(&azure)
        .await;

    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("authorization", "Bearer sk-test-0123456789"))
        .respond_with(EchoEmbeddings)
        .mount(&openai)
        .await;

    let selection = select_provider(&config(azure_at(&azure), openai_at(&openai))).await;

    assert_eq!(selection.provider.kind(), ProviderKind::OpenAi);
    assert_eq!(selection.outcomes[0].provider, ProviderKind::Azure);
    match &selection.outcomes[0].status {
        ProbeStatus::Failed { reason } => assert!(reason.contains("500"), "{reason}"),
        other => panic!("expected failed probe, got {other:?}"),
    }
    assert!(matches!(
        selection.outcomes[1].status,
        ProbeStatus::Selected { dimension: 3, .. }
    ));
}

#[tokio::test]
async fn unconfigured_chain_ends_at_null() {
    let placeholder = OpenAiConfig {
        api_key: Some("tu_clave_openai_aqui".into()),
        ..OpenAiConfig::default()
    };
    let selection = select_provider(&config(unusable_azure(), placeholder)).await;

    assert_eq!(selection.provider.kind(), ProviderKind::Null);
    assert!(!selection.provider.is_available());
    assert_eq!(selection.outcomes.len(), 3);
    assert!(matches!(
        selection.outcomes[0].status,
        ProbeStatus::Skipped { .. }
    ));
    assert!(matches!(
        selection.outcomes[1].status,
        ProbeStatus::Skipped { .. }
    ));
    assert_eq!(selection.outcomes[2].provider, ProviderKind::Null);
}

#[tokio::test]
async fn slow_probe_times_out_and_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoEmbeddings)
        .mount(&server)
        .await;
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"index": 0, "embedding": [1.0]}]}))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&slow)
        .await;

    let selection = select_provider(&config(azure_at(&slow), openai_at(&server))).await;

    match &selection.outcomes[0].status {
        ProbeStatus::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(selection.provider.kind(), ProviderKind::OpenAi);
}

#[tokio::test]
async fn batch_embeddings_are_ordered_and_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoEmbeddings)
        .mount(&server)
        .await;

    let selection = select_provider(&config(unusable_azure(), openai_at(&server))).await;
    let provider = selection.provider;

    let texts = vec!["primero".to_string(), "segundo".to_string()];
    let vectors = provider.embed_batch(&texts).await.unwrap();

    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
    let inv = 1.0 / 2.0_f32.sqrt();
    assert!((vectors[1][0] - inv).abs() < 1e-6);
    assert!((vectors[1][1] - inv).abs() < 1e-6);
}

#[tokio::test]
async fn short_response_is_a_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoEmbeddings)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"index": 0, "embedding": [1.0, 0.0, 0.0]}]})),
        )
        .mount(&server)
        .await;

    let selection = select_provider(&config(unusable_azure(), openai_at(&server))).await;
    assert_eq!(selection.provider.kind(), ProviderKind::OpenAi);

    let texts = vec!["a".to_string(), "b".to_string()];
    let err = selection.provider.embed_batch(&texts).await.unwrap_err();
    assert!(err.to_string().contains("1 embeddings for 2 inputs"), "{err}");
}
