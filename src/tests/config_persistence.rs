use super::mocks::Script;
use super::{Harness, Mode};
use crate::config::controller::CONFIG_KEY;
use crate::config::{AppConfig, ConfigController, FeatureKind, ProviderKind};
use crate::scope::ExecutionScope;
use std::sync::Arc;
use std::time::Duration;

fn controller(harness: &Harness) -> Arc<ConfigController> {
    Arc::new(ConfigController::new(harness.storage.clone(), harness.router.clone()))
}

#[tokio::test(start_paused = true)]
async fn test_rapid_edits_are_saved_once() {
    let harness = Harness::new(Mode::Direct, Script::default());
    let controller = controller(&harness);
    controller.load().await.unwrap();

    controller.update(|c| c.feature_mut(FeatureKind::Chat).enabled = true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.update(|c| c.feature_mut(FeatureKind::Chat).openai.api_key = "sk-live".to_string());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let edited = controller.update(|c| c.feature_mut(FeatureKind::Chat).openai.model = "gpt-4o".to_string());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.persisted_writes(), 0);
    assert_eq!(harness.factory.created(), 0);

    tokio::time::sleep(Duration::from_millis(edited.autosave_debounce_ms)).await;
    assert_eq!(controller.persisted_writes(), 1);
    assert_eq!(harness.factory.created(), 1);
    assert!(harness.router.is_configured(FeatureKind::Chat).await.unwrap());

    let saved: AppConfig = harness.storage.config().load(CONFIG_KEY).await.unwrap().unwrap();
    assert_eq!(saved, edited);
    assert_eq!(saved.feature(FeatureKind::Chat).openai.model, "gpt-4o");
}

#[tokio::test]
async fn test_saved_configuration_survives_reload_over_bridge() {
    let harness = Harness::new(Mode::Bridged, Script::default());
    let controller = controller(&harness);
    controller.load().await.unwrap();

    controller.update(|c| {
        let chat = c.feature_mut(FeatureKind::Chat);
        chat.enabled = true;
        chat.openai.api_key = "sk-live".to_string();
    });
    assert_eq!(controller.flush().await.unwrap(), vec![FeatureKind::Chat]);
    assert_eq!(controller.persisted_writes(), 1);
    assert!(controller.flush().await.unwrap().is_empty());

    let restarted = ConfigController::new(harness.storage.clone(), harness.router.clone());
    let restored = restarted.load().await.unwrap();
    assert_eq!(restored, controller.current());
    assert!(restarted.validate()[&FeatureKind::Chat].valid);

    // Same settings, same session.
    assert_eq!(harness.factory.created(), 1);
    assert!(harness
        .manager
        .is_configured(ExecutionScope::DEFAULT, FeatureKind::Chat));
}

#[tokio::test]
async fn test_only_changed_features_are_reconfigured() {
    let harness = Harness::new(Mode::Direct, Script::default());
    let controller = controller(&harness);
    controller.load().await.unwrap();

    controller.update(|c| {
        let chat = c.feature_mut(FeatureKind::Chat);
        chat.enabled = true;
        chat.openai.api_key = "sk-live".to_string();
        let summarize = c.feature_mut(FeatureKind::Summarize);
        summarize.enabled = true;
        summarize.inherit_chat_provider = true;
    });
    assert_eq!(
        controller.flush().await.unwrap(),
        vec![FeatureKind::Chat, FeatureKind::Summarize]
    );
    let summarize = harness
        .manager
        .session(ExecutionScope::DEFAULT, FeatureKind::Summarize)
        .unwrap();
    assert_eq!(summarize.provider, ProviderKind::OpenAi);

    controller.update(|c| c.feature_mut(FeatureKind::Chat).provider = ProviderKind::Ollama);
    assert_eq!(controller.flush().await.unwrap(), vec![FeatureKind::Chat]);

    // Summarize did not change itself but follows the chat provider.
    let followed = harness
        .manager
        .session(ExecutionScope::DEFAULT, FeatureKind::Summarize)
        .unwrap();
    assert_eq!(followed.provider, ProviderKind::Ollama);
    assert_ne!(followed.id, summarize.id);
    assert_eq!(harness.factory.created(), 4);
    assert_eq!(controller.persisted_writes(), 2);
}

#[tokio::test]
async fn test_invalid_edit_is_saved_but_reported() {
    let harness = Harness::new(Mode::Direct, Script::default());
    let controller = controller(&harness);
    controller.load().await.unwrap();

    controller.update(|c| c.feature_mut(FeatureKind::Translate).enabled = true);
    assert_eq!(controller.flush().await.unwrap(), vec![FeatureKind::Translate]);

    let reports = controller.validate();
    let translate = &reports[&FeatureKind::Translate];
    assert!(!translate.valid);
    assert!(translate.errors.contains(&"openai.api_key is required".to_string()));
    assert!(!harness.router.is_configured(FeatureKind::Translate).await.unwrap());
    assert_eq!(harness.factory.created(), 0);
}
