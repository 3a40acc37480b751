//! Typed records for the chat and files namespaces.

use super::Storage;
use crate::error::AssistantError;
use crate::providers::{ChatMessage, ChatRole};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 60;

/// A saved chat transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            messages: Vec::new(),
        }
    }

    /// A transcript titled after its first user message.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let title = messages
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| title_from(&m.content))
            .unwrap_or_else(|| "New chat".to_string());
        Self {
            messages,
            ..Self::new(title)
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }
}

fn title_from(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}…", cut.trim_end())
}

/// A stored file; content is base64 so the record stays plain JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub mime_type: String,
    pub content_base64: String,
}

impl FileRecord {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            content_base64: STANDARD.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, AssistantError> {
        STANDARD
            .decode(&self.content_base64)
            .map_err(|e| AssistantError::storage(format!("file '{}' is not valid base64: {}", self.name, e)))
    }
}

impl Storage {
    pub async fn save_chat(&self, chat: &ChatRecord) -> Result<(), AssistantError> {
        self.chat().save(&chat.id, chat).await
    }

    pub async fn load_chat(&self, id: &str) -> Result<Option<ChatRecord>, AssistantError> {
        self.chat().load(id).await
    }

    /// All saved chats, most recently updated first.
    pub async fn list_chats(&self) -> Result<Vec<ChatRecord>, AssistantError> {
        let ids: Vec<String> = self
            .chat()
            .get_all::<serde_json::Value>()
            .await?
            .into_keys()
            .collect();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.chat().load_record::<ChatRecord>(&id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records.into_iter().map(|r| r.value).collect())
    }

    pub async fn delete_chat(&self, id: &str) -> Result<bool, AssistantError> {
        self.chat().remove(id).await
    }

    pub async fn save_file(&self, file: &FileRecord) -> Result<(), AssistantError> {
        self.files().save(&file.name, file).await
    }

    pub async fn load_file(&self, name: &str) -> Result<Option<FileRecord>, AssistantError> {
        self.files().load(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::sync::Arc;

    #[test]
    fn test_chat_title_from_first_user_message() {
        let chat = ChatRecord::from_messages(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("What is the capital of France?\nAnd why?"),
        ]);
        assert_eq!(chat.title, "What is the capital of France?");

        let long = ChatRecord::from_messages(vec![ChatMessage::user("x".repeat(100))]);
        assert_eq!(long.title.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(long.title.ends_with('…'));
    }

    #[test]
    fn test_file_record_base64() {
        let file = FileRecord::from_bytes("a.bin", "application/octet-stream", &[0, 159, 255]);
        assert_eq!(file.content_base64, "AJ//");
        assert_eq!(file.bytes().unwrap(), vec![0, 159, 255]);

        let broken = FileRecord {
            content_base64: "***".to_string(),
            ..file
        };
        assert!(broken.bytes().is_err());
    }

    #[tokio::test]
    async fn test_chat_and_file_helpers() {
        let storage = Storage::local(Arc::new(LocalStorage::in_memory()));

        let mut chat = ChatRecord::new("Trip planning");
        chat.push(ChatMessage::user("Plan a weekend in Lisbon"));
        chat.push(ChatMessage::assistant("Day one: Alfama."));
        storage.save_chat(&chat).await.unwrap();

        assert_eq!(storage.load_chat(&chat.id).await.unwrap(), Some(chat.clone()));
        assert_eq!(storage.list_chats().await.unwrap(), vec![chat.clone()]);
        assert!(storage.delete_chat(&chat.id).await.unwrap());
        assert!(storage.list_chats().await.unwrap().is_empty());

        let file = FileRecord::from_bytes("notes.txt", "text/plain", b"hello");
        storage.save_file(&file).await.unwrap();
        let loaded = storage.load_file("notes.txt").await.unwrap().unwrap();
        assert_eq!(loaded.bytes().unwrap(), b"hello");
    }
}
