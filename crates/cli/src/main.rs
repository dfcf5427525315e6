//! # usewasm CLI
//!
//! URLからWASMモジュールをロードし、エクスポート一覧を表示する。
//! `--invoke` 指定時はエクスポート関数を呼び出して結果を表示する。
//!
//! ## 使い方
//! ```text
//! usewasm-cli https://cdn.example/fibonacci.wasm --invoke fibonacci --arg 90
//! usewasm-cli compute.wasm --streaming --header "X-Api-Key: k" --json
//! ```
//!
//! 設定は環境変数（`USEWASM_*`）から読み込む。

mod host;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use usewasm_core::{
    HttpClient, LoadCoordinator, LoadOptions, LoadOutcome, LoadRequest, LoaderConfig,
};
use usewasm_types::{FetchOptions, LoadSummary, MemoryLimits};
use usewasm_wasm_host::{Exports, RuntimeConfig, Value, WasmtimeRuntime};

#[derive(Parser, Debug)]
#[command(name = "usewasm-cli", version, about = "WASMモジュールをロードしてエクスポートを確認する")]
struct Cli {
    /// モジュールのURL（USEWASM_BASE_URL設定時は相対パスも可）
    url: String,

    /// ストリーミングインスタンス化を使う（application/wasm で配信されている必要がある）
    #[arg(long)]
    streaming: bool,

    /// 追加のリクエストヘッダー（"名前: 値"、複数指定可）
    #[arg(long = "header", value_name = "K:V")]
    headers: Vec<String>,

    /// 内部生成メモリの初期ページ数
    #[arg(long)]
    initial_pages: Option<u32>,

    /// 内部生成メモリの最大ページ数
    #[arg(long)]
    maximum_pages: Option<u32>,

    /// メモリもインポートも渡さずにインスタンス化する
    #[arg(long)]
    no_imports: bool,

    /// ロード後に呼び出すエクスポート関数
    #[arg(long, value_name = "NAME")]
    invoke: Option<String>,

    /// 関数の引数（シグネチャの型で解釈する）
    #[arg(long = "arg", value_name = "V", requires = "invoke", allow_hyphen_values = true)]
    args: Vec<String>,

    /// JSONで出力する
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = LoaderConfig::from_env()?;
    let network = HttpClient::new(config.request_timeout)?;
    let runtime = WasmtimeRuntime::new(RuntimeConfig {
        fuel_limit: config.fuel_limit,
    })?;
    let options = build_options(&cli, &config)?;

    let mut loader: LoadCoordinator =
        LoadCoordinator::new(Arc::new(network), Arc::new(runtime), config);
    let handle = loader
        .load(LoadRequest::new(cli.url.clone()).with_options(options))?
        .context("ロード要求が受け付けられませんでした")?;

    match handle.join().await? {
        LoadOutcome::Ready => {}
        LoadOutcome::Cancelled => bail!("ロードが中断されました"),
    }

    let state = loader.state();
    let summary = state.summary();
    let invocation = match &cli.invoke {
        Some(name) => Some((name.as_str(), invoke(&state.exports, name, &cli.args)?)),
        None => None,
    };

    if cli.json {
        println!("{}", render_json(&summary, invocation.as_ref())?);
    } else {
        print!("{}", render_text(&summary));
        if let Some((name, results)) = &invocation {
            println!("{name}({}) = {}", cli.args.join(", "), join_values(results));
        }
    }

    loader.teardown();
    Ok(())
}

/// コマンドライン引数からロードオプションを組み立てる。
fn build_options(cli: &Cli, config: &LoaderConfig) -> anyhow::Result<LoadOptions> {
    let mut fetch = FetchOptions::default();
    for raw in &cli.headers {
        let (name, value) = parse_header(raw)?;
        fetch = fetch.header(name, value);
    }

    let mut options = LoadOptions::default()
        .streaming(cli.streaming)
        .with_fetch(fetch);
    if cli.initial_pages.is_some() || cli.maximum_pages.is_some() {
        options = options.with_limits(MemoryLimits::new(
            cli.initial_pages.unwrap_or(config.default_limits.initial),
            cli.maximum_pages.unwrap_or(config.default_limits.maximum),
        ));
    }
    if cli.no_imports {
        options = options.without_imports();
    } else {
        options = options.with_env(host::console_env);
    }
    Ok(options)
}

/// "名前: 値" 形式のヘッダーを分解する。
fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("ヘッダーは \"名前: 値\" の形式で指定してください: {raw}");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("ヘッダー名が空です: {raw}");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// エクスポート関数を文字列引数で呼び出す。
fn invoke(exports: &Exports, name: &str, args: &[String]) -> anyhow::Result<Vec<Value>> {
    let function = exports
        .function(name)
        .with_context(|| format!("関数エクスポート {name} が見つかりません"))?;
    let params = &function.signature().params;
    if params.len() != args.len() {
        bail!(
            "{name} の引数は {} 個です（{} 個指定されました）: {}",
            params.len(),
            args.len(),
            function.signature()
        );
    }
    let values = params
        .iter()
        .zip(args)
        .map(|(ty, raw)| Value::parse(*ty, raw))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(name, ?values, "エクスポート関数を呼び出します");
    Ok(function.call(&values)?)
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_text(summary: &LoadSummary) -> String {
    let mut out = String::from("exports:\n");
    for export in &summary.exports {
        match &export.signature {
            Some(signature) => {
                out.push_str(&format!("  {:<20} {} {signature}\n", export.name, export.kind))
            }
            None => out.push_str(&format!("  {:<20} {}\n", export.name, export.kind)),
        }
    }
    if let Some(pages) = summary.memory_pages {
        out.push_str(&format!("memory: {pages} pages\n"));
    }
    out
}

fn render_json(
    summary: &LoadSummary,
    invocation: Option<&(&str, Vec<Value>)>,
) -> anyhow::Result<String> {
    let mut value = serde_json::to_value(summary)?;
    if let Some((name, results)) = invocation {
        value["invoke"] = serde_json::json!({
            "name": name,
            "results": results.iter().map(Value::to_string).collect::<Vec<_>>(),
        });
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

#[cfg(test)]
mod tests {
    use usewasm_types::{ExportKind, ExportSummary};
    use usewasm_wasm_host::{ImportMap, ModuleRuntime};

    use super::*;

    const FIBONACCI_WAT: &str = r#"
        (module
          (func (export "fibonacci") (param i32) (result i64)
            (local $a i64) (local $b i64) (local $t i64)
            i64.const 1
            local.set $b
            block $done
              loop $next
                local.get 0
                i32.eqz
                br_if $done
                local.get $a
                local.get $b
                i64.add
                local.set $t
                local.get $b
                local.set $a
                local.get $t
                local.set $b
                local.get 0
                i32.const 1
                i32.sub
                local.set 0
                br $next
              end
            end
            local.get $a))
    "#;

    fn fibonacci_exports() -> Exports {
        let rt = WasmtimeRuntime::new(RuntimeConfig::default()).unwrap();
        rt.instantiate(&wat::parse_str(FIBONACCI_WAT).unwrap(), &ImportMap::empty())
            .unwrap()
            .instance
            .exports()
            .unwrap()
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Api-Key: secret").unwrap(),
            ("X-Api-Key".to_string(), "secret".to_string())
        );
        assert_eq!(
            parse_header("Authorization:Bearer a:b").unwrap(),
            ("Authorization".to_string(), "Bearer a:b".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "usewasm-cli",
            "compute.wasm",
            "--streaming",
            "--header",
            "X-A: 1",
            "--header",
            "X-B: 2",
            "--initial-pages",
            "2",
            "--invoke",
            "add",
            "--arg",
            "-1",
            "--arg",
            "3",
        ]);
        assert!(cli.streaming);
        assert_eq!(cli.headers.len(), 2);
        assert_eq!(cli.args, vec!["-1", "3"]);

        let options = build_options(&cli, &LoaderConfig::default()).unwrap();
        assert_eq!(options.limits, Some(MemoryLimits::new(2, 512)));
        assert_eq!(options.fetch.headers[1], ("X-B".to_string(), "2".to_string()));
        assert!(options.env.is_some());
        assert!(options.link_imports);
    }

    #[test]
    fn test_no_imports_flag() {
        let cli = Cli::parse_from(["usewasm-cli", "compute.wasm", "--no-imports"]);
        let options = build_options(&cli, &LoaderConfig::default()).unwrap();
        assert!(!options.link_imports);
        assert!(options.env.is_none());
        assert!(options.limits.is_none());
    }

    #[test]
    fn test_invoke_parses_arguments_per_signature() {
        let exports = fibonacci_exports();
        let args = vec!["90".to_string()];
        assert_eq!(
            invoke(&exports, "fibonacci", &args).unwrap(),
            vec![Value::I64(2_880_067_194_370_816_120)]
        );
        assert!(invoke(&exports, "fibonacci", &[]).is_err());
        assert!(invoke(&exports, "fibonacci", &["ten".to_string()]).is_err());
        assert!(invoke(&exports, "missing", &[]).is_err());
    }

    #[test]
    fn test_render_outputs() {
        let summary = LoadSummary {
            is_loading: false,
            exports: vec![ExportSummary {
                name: "fibonacci".to_string(),
                kind: ExportKind::Function,
                signature: Some("(i32) -> (i64)".to_string()),
            }],
            memory_pages: Some(256),
        };
        let text = render_text(&summary);
        assert!(text.contains("fibonacci"));
        assert!(text.contains("(i32) -> (i64)"));
        assert!(text.contains("memory: 256 pages"));

        let invocation = ("fibonacci", vec![Value::I64(55)]);
        let json: serde_json::Value =
            serde_json::from_str(&render_json(&summary, Some(&invocation)).unwrap()).unwrap();
        assert_eq!(json["is_loading"], false);
        assert_eq!(json["exports"][0]["kind"], "function");
        assert_eq!(json["invoke"]["results"][0], "55");
    }
}
