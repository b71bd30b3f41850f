use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use hookline::config::{DEFAULT_LLAMA_BIN, DEFAULT_MODEL};
use hookline::{EngineConfig, GenerationParams};

/// Run prompts through a plugin pipeline around a text-generation backend.
#[derive(Parser, Debug)]
#[command(name = "hookline", version, about)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,

    /// Log filter, e.g. "info" or "hookline=debug"
    #[arg(long, global = true, default_value = "info", env = "HOOKLINE_LOG_LEVEL")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one prompt through the pipeline and print the result
    Complete {
        prompt: String,

        /// Print fragments as they arrive (post-process hooks are skipped)
        #[arg(long)]
        stream: bool,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        top_p: Option<f32>,

        #[command(flatten)]
        engine: EngineOpts,
    },
    /// Print the resolved, ordered plugin list
    Plugins {
        #[command(flatten)]
        engine: EngineOpts,
    },
    /// Serve a pool worker over stdin/stdout
    #[command(hide = true)]
    Worker {
        /// JSON description of the local model to load
        #[arg(long)]
        spec: String,
    },
}

#[derive(Args, Debug)]
pub struct EngineOpts {
    /// Hosted model name or path to local weights
    #[arg(long, default_value = DEFAULT_MODEL, env = "HOOKLINE_MODEL")]
    pub model: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "OPENAI_API_BASE")]
    pub api_base: Option<String>,

    /// Worker processes for local models (0 loads the model in-process)
    #[arg(long, default_value_t = 0, env = "HOOKLINE_WORKERS")]
    pub workers: usize,

    /// llama.cpp CLI used for native weight files
    #[arg(long, default_value = DEFAULT_LLAMA_BIN, env = "HOOKLINE_LLAMA_BIN")]
    pub llama_bin: String,

    /// Command for other local models (prompt on stdin, text on stdout)
    #[arg(long, env = "HOOKLINE_RUNNER")]
    pub runner: Option<String>,

    /// Completion cache capacity (0 disables caching)
    #[arg(long, default_value_t = 0, env = "HOOKLINE_CACHE_SIZE")]
    pub cache_size: usize,

    /// Plugin configuration file (YAML or JSON)
    #[arg(long, env = "HOOKLINE_PLUGIN_FILE")]
    pub plugin_file: Option<PathBuf>,

    /// Directories searched for plugin manifests
    #[arg(long = "plugin-dir", env = "HOOKLINE_PLUGIN_DIR", value_delimiter = ':')]
    pub plugin_dirs: Vec<PathBuf>,

    /// Plugins to load instead of the configured list
    #[arg(long = "plugin")]
    pub plugins: Vec<String>,
}

impl EngineOpts {
    pub fn to_config(&self) -> EngineConfig {
        EngineConfig {
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            api_base: self.api_base.clone(),
            workers: self.workers,
            llama_bin: self.llama_bin.clone(),
            runner: self.runner.clone(),
            cache_size: self.cache_size,
            worker_program: None,
            plugin_file: self.plugin_file.clone(),
            plugin_dirs: self.plugin_dirs.clone(),
        }
    }

    /// Explicit plugin list, or `None` to use the configured one.
    pub fn plugin_names(&self) -> Option<&[String]> {
        if self.plugins.is_empty() {
            None
        } else {
            Some(&self.plugins)
        }
    }
}

pub fn generation_params(
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
) -> GenerationParams {
    GenerationParams {
        max_tokens,
        temperature,
        top_p,
    }
}

pub fn get_opts() -> Opts {
    Opts::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_with_plugins() {
        let opts = Opts::try_parse_from([
            "hookline",
            "complete",
            "hi",
            "--model",
            "models/tiny.gguf",
            "--plugin",
            "upper",
            "--plugin",
            "wrap",
            "--max-tokens",
            "32",
        ])
        .unwrap();
        match opts.command {
            Command::Complete {
                prompt,
                max_tokens,
                stream,
                engine,
                ..
            } => {
                assert_eq!(prompt, "hi");
                assert_eq!(max_tokens, Some(32));
                assert!(!stream);
                assert_eq!(engine.plugin_names().unwrap(), ["upper", "wrap"]);
                assert_eq!(engine.to_config().model, "models/tiny.gguf");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn empty_plugin_list_defers_to_store() {
        let opts = Opts::try_parse_from(["hookline", "plugins", "--model", "m"]).unwrap();
        match opts.command {
            Command::Plugins { engine } => assert!(engine.plugin_names().is_none()),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
