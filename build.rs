use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    voice: Voice,
    audio: Audio,
    timeouts: Timeouts,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    model: String,
    api_key_env: String,
}

#[derive(Deserialize)]
struct Voice {
    name: String,
    default_language: String,
    languages: Vec<String>,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
    frame_size: usize,
    playback_period_size: usize,
}

#[derive(Deserialize)]
struct Timeouts {
    capture_secs: u64,
    connect_secs: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    if config.voice.languages.iter().any(|l| l.contains(',')) {
        panic!("language names in config.toml must not contain ','");
    }

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=MODEL={}", config.network.model);
    println!("cargo:rustc-env=API_KEY_ENV={}", config.network.api_key_env);

    // 语音与语言
    println!("cargo:rustc-env=VOICE_NAME={}", config.voice.name);
    println!("cargo:rustc-env=DEFAULT_LANGUAGE={}", config.voice.default_language);
    println!("cargo:rustc-env=LANGUAGES={}", config.voice.languages.join(","));

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=FRAME_SIZE={}", config.audio.frame_size);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);

    // 超时
    println!("cargo:rustc-env=CAPTURE_TIMEOUT_SECS={}", config.timeouts.capture_secs);
    println!("cargo:rustc-env=CONNECT_TIMEOUT_SECS={}", config.timeouts.connect_secs);
}
