pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    client::{AppState, ClientConfig, VibeClient},
    conversation::{ConversationConfig, ConversationSession},
    errors::VibeError,
    friend::{Friend, FriendService},
    message::{LocalMessage, VibeEnvelope},
    scoring::{grade_guess, match_score, GuessOutcome},
    store::{RecordStore, RestRecordStore, SqliteRecordStore},
};
