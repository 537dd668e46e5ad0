use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "colloquy.toml";
const CONFIG_PATH_ENV: &str = "COLLOQUY_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfyUIConfig {
    #[serde(default = "default_comfyui_url")]
    pub api_url: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_comfy_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_comfyui_url() -> String {
    "http://127.0.0.1:8188".to_string()
}

fn default_model_name() -> String {
    "v1-5-pruned-emaonly.safetensors".to_string()
}

fn default_steps() -> u32 {
    20
}

fn default_cfg_scale() -> f32 {
    7.0
}

fn default_sampler() -> String {
    "euler".to_string()
}

fn default_scheduler() -> String {
    "normal".to_string()
}

fn default_comfy_timeout_secs() -> u64 {
    300
}

impl Default for ComfyUIConfig {
    fn default() -> Self {
        Self {
            api_url: default_comfyui_url(),
            model_name: default_model_name(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            negative_prompt: String::new(),
            timeout_secs: default_comfy_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Multi-worker fan-out
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_hub_port")]
    pub hub_port: u16,
    #[serde(default = "default_task_workers")]
    pub task_workers: usize,

    #[serde(default)]
    pub debug: bool,

    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    #[serde(default)]
    pub comfyui: ComfyUIConfig,

    #[serde(default)]
    pub rag_service_url: Option<String>,

    // Server-wide image caps, overridden per user
    #[serde(default = "default_max_image_width")]
    pub max_image_width: u32,
    #[serde(default = "default_max_image_height")]
    pub max_image_height: u32,

    #[serde(default = "default_session_teardown_secs")]
    pub session_teardown_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_data_dir() -> String {
    ServerConfig::get_base_dir()
        .join("user_data")
        .to_string_lossy()
        .to_string()
}

fn default_database_path() -> String {
    ServerConfig::get_base_dir()
        .join("colloquy.db")
        .to_string_lossy()
        .to_string()
}

fn default_workers() -> usize {
    1
}

fn default_hub_port() -> u16 {
    9191
}

fn default_task_workers() -> usize {
    2
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_max_image_width() -> u32 {
    2048
}

fn default_max_image_height() -> u32 {
    2048
}

fn default_session_teardown_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            database_path: default_database_path(),
            workers: default_workers(),
            hub_port: default_hub_port(),
            task_workers: default_task_workers(),
            debug: false,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            comfyui: ComfyUIConfig::default(),
            rag_service_url: None,
            max_image_width: default_max_image_width(),
            max_image_height: default_max_image_height(),
            session_teardown_secs: default_session_teardown_secs(),
        }
    }
}

impl ServerConfig {
    /// Directory holding the executable; relative defaults resolve against it.
    pub fn get_base_dir() -> PathBuf {
        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn config_path() -> PathBuf {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join(CONFIG_FILE_NAME),
        }
    }

    /// Load `colloquy.toml`, then let environment variables override individual keys.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<ServerConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        base.apply_env()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    fn apply_env(mut self) -> Self {
        if let Ok(addr) = env::var("COLLOQUY_BIND") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }

        if let Ok(dir) = env::var("COLLOQUY_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = dir;
            }
        }

        if let Ok(path) = env::var("COLLOQUY_DATABASE") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(workers) = env::var("COLLOQUY_WORKERS") {
            if let Ok(workers) = workers.parse::<usize>() {
                self.workers = workers.max(1);
            }
        }

        if let Ok(port) = env::var("COLLOQUY_HUB_PORT") {
            if let Ok(port) = port.parse() {
                self.hub_port = port;
            }
        }

        if let Ok(debug) = env::var("COLLOQUY_DEBUG") {
            self.debug = parse_bool_flag(&debug);
        }

        if let Ok(width) = env::var("COLLOQUY_MAX_IMAGE_WIDTH") {
            if let Ok(width) = width.parse() {
                self.max_image_width = width;
            }
        }

        if let Ok(height) = env::var("COLLOQUY_MAX_IMAGE_HEIGHT") {
            if let Ok(height) = height.parse() {
                self.max_image_height = height;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }

        if let Ok(url) = env::var("COMFYUI_URL") {
            self.comfyui.api_url = url;
        }

        if let Ok(url) = env::var("RAG_SERVICE_URL") {
            if !url.trim().is_empty() {
                self.rag_service_url = Some(url);
            }
        }

        self
    }
}

pub fn parse_bool_flag(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

/// Per-user settings stored as JSON on the user row. Every field has a default so older
/// rows keep loading as new knobs appear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPreferences {
    /// `binding/model` reference; `None` falls back to the server default model.
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
    #[serde(default)]
    pub ctx_size: Option<u32>,

    #[serde(default = "default_rag_top_k")]
    pub rag_top_k: usize,
    #[serde(default = "default_rag_n_hops")]
    pub rag_n_hops: usize,
    #[serde(default)]
    pub rag_min_sim_percent: f32,

    #[serde(default = "default_true")]
    pub memory_enabled: bool,
    #[serde(default)]
    pub auto_memory_enabled: bool,

    #[serde(default)]
    pub image_generation_enabled: bool,
    #[serde(default)]
    pub image_editing_enabled: bool,
    #[serde(default)]
    pub slide_generation_enabled: bool,
    #[serde(default = "default_true")]
    pub activate_generated_images: bool,
    #[serde(default)]
    pub image_annotation_enabled: bool,
    #[serde(default)]
    pub note_generation_enabled: bool,

    #[serde(default)]
    pub web_search_enabled: bool,
    #[serde(default)]
    pub web_search_deep_analysis: bool,
    #[serde(default)]
    pub google_api_key: Option<String>,
    #[serde(default)]
    pub google_cse_id: Option<String>,

    #[serde(default)]
    pub preferred_name: Option<String>,
    #[serde(default)]
    pub personal_info: Option<String>,
    #[serde(default)]
    pub share_personal_info: bool,
    #[serde(default)]
    pub share_os_info: bool,
    #[serde(default)]
    pub fun_mode: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub show_reasoning: bool,
    #[serde(default = "default_true")]
    pub auto_title: bool,

    #[serde(default)]
    pub max_image_width: Option<u32>,
    #[serde(default)]
    pub max_image_height: Option<u32>,

    #[serde(default)]
    pub data_zone: String,
    #[serde(default)]
    pub active_personality_id: Option<String>,
}

fn default_rag_top_k() -> usize {
    5
}

fn default_rag_n_hops() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            llm_model: None,
            temperature: None,
            top_k: None,
            top_p: None,
            repeat_penalty: None,
            ctx_size: None,
            rag_top_k: default_rag_top_k(),
            rag_n_hops: default_rag_n_hops(),
            rag_min_sim_percent: 0.0,
            memory_enabled: true,
            auto_memory_enabled: false,
            image_generation_enabled: false,
            image_editing_enabled: false,
            slide_generation_enabled: false,
            activate_generated_images: true,
            image_annotation_enabled: false,
            note_generation_enabled: false,
            web_search_enabled: false,
            web_search_deep_analysis: false,
            google_api_key: None,
            google_cse_id: None,
            preferred_name: None,
            personal_info: None,
            share_personal_info: false,
            share_os_info: false,
            fun_mode: false,
            language: None,
            show_reasoning: false,
            auto_title: true,
            max_image_width: None,
            max_image_height: None,
            data_zone: String::new(),
            active_personality_id: None,
        }
    }
}

impl UserPreferences {
    /// Model name without the `binding/` prefix.
    pub fn model_name(&self) -> Option<&str> {
        self.llm_model
            .as_deref()
            .map(|reference| reference.rsplit_once('/').map_or(reference, |(_, m)| m))
            .filter(|name| !name.trim().is_empty())
    }

    pub fn image_caps(&self, config: &ServerConfig) -> (u32, u32) {
        (
            self.max_image_width.unwrap_or(config.max_image_width),
            self.max_image_height.unwrap_or(config.max_image_height),
        )
    }
}
