//! 表情生成模块
//!
//! 把一句话转换成表情序列与游戏元数据（主题、线索、难度、积分）

pub mod generator;
pub mod models;

pub use generator::{
    analyze_or_fallback, GeminiVibeGenerator, StaticVibeGenerator, VibeGenerator,
    DEFAULT_GENERATOR_BASE_URL, DEFAULT_GENERATOR_MODEL,
};
pub use models::{parse_analysis, VibeAnalysis};
