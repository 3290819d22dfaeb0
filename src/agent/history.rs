//! チャットごとの会話履歴（メモリ内リングバッファ）

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::llm::ChatMessage;

pub struct ChatHistory {
    chats: Mutex<HashMap<i64, VecDeque<ChatMessage>>>,
    limit: usize,
}

impl ChatHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            chats: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, VecDeque<ChatMessage>>> {
        self.chats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// メッセージを追加。上限を超えたら最古を捨てる
    pub fn push(&self, chat_id: i64, message: ChatMessage) {
        let mut chats = self.lock();
        let ring = chats.entry(chat_id).or_default();
        if ring.len() >= self.limit {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    /// 履歴を時系列順で取得
    pub fn get(&self, chat_id: i64) -> Vec<ChatMessage> {
        self.lock()
            .get(&chat_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 直近n件を取得
    pub fn recent(&self, chat_id: i64, n: usize) -> Vec<ChatMessage> {
        let chats = self.lock();
        let Some(ring) = chats.get(&chat_id) else {
            return Vec::new();
        };
        ring.iter().skip(ring.len().saturating_sub(n)).cloned().collect()
    }

    /// チャットの履歴を消去
    pub fn clear(&self, chat_id: i64) {
        self.lock().remove(&chat_id);
    }

    pub fn is_empty(&self, chat_id: i64) -> bool {
        self.lock().get(&chat_id).map_or(true, |r| r.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_get() {
        let history = ChatHistory::new(10);
        history.push(1, ChatMessage::user("hallo"));
        history.push(1, ChatMessage::assistant("Hallo!"));

        let messages = history.get(1);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "Hallo!");
    }

    #[test]
    fn test_limit_drops_oldest() {
        let history = ChatHistory::new(3);
        for i in 0..5 {
            history.push(1, ChatMessage::user(format!("msg{}", i)));
        }

        let messages = history.get(1);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "msg2");
        assert_eq!(messages[2].content, "msg4");
    }

    #[test]
    fn test_chats_are_isolated() {
        let history = ChatHistory::new(10);
        history.push(1, ChatMessage::user("a"));
        history.push(2, ChatMessage::user("b"));

        assert_eq!(history.get(1).len(), 1);
        assert_eq!(history.get(2).len(), 1);
        assert_eq!(history.get(1)[0].content, "a");
    }

    #[test]
    fn test_recent() {
        let history = ChatHistory::new(10);
        for i in 0..5 {
            history.push(1, ChatMessage::user(format!("msg{}", i)));
        }

        let recent = history.recent(1, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "msg3");
    }

    #[test]
    fn test_clear() {
        let history = ChatHistory::new(10);
        history.push(1, ChatMessage::user("a"));
        history.clear(1);
        assert!(history.is_empty(1));
    }
}
