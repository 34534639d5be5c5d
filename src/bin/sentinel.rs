// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 数字卫兵 (Digital Sentinel)
///
/// 实时检测 + 身份识别 + 告警
///
/// 系统架构:
/// 1. 生产线程: 视频源 → 推理引擎
/// 2. 推理线程: 检测与分割, 合成渲染
/// 3. 跟踪线程: 多目标跟踪, 提交识别
/// 4. 识别线程: 特征提取与人脸库匹配
/// 5. 主线程:   告警评估与输出
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use sentinel_rs::config::{parse_class_list, Args, PipelineConfig, INF_SIZE};
use sentinel_rs::engine::{
    Accelerator, ClassListCompiler, InferenceEngine, ModelCompiler, PassThroughAccelerator,
};
use sentinel_rs::input::open_source;
use sentinel_rs::logging::init_logging;
use sentinel_rs::pipeline::{FrameSink, NullSink, Pipeline, PipelineContext, SnapshotSink};
use sentinel_rs::recognition::{AppearanceEmbedder, Embedder, Gallery};
use sentinel_rs::SentinelError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type Backend = (Box<dyn ModelCompiler>, Box<dyn Accelerator>);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args.log_level, args.log_dir.as_deref())?;

    info!("🚀 数字卫兵启动");
    let mut config = PipelineConfig::load(&args.config)
        .with_context(|| format!("加载配置 {}", args.config.display()))?;
    config.apply_args(&args)?;
    config.log_summary();

    // 推理引擎
    let (compiler, accelerator) = build_backend(&args.backend, &config)?;
    let engine = InferenceEngine::start(compiler, accelerator, &config).context("启动推理引擎")?;

    // 人脸库: 只指定姓名时只加载该身份
    let embedder = build_embedder(&config)?;
    let only = match (&args.name, &args.image_file) {
        (Some(name), None) => Some(name.as_str()),
        _ => None,
    };
    let gallery = Arc::new(
        Gallery::load(&config.gallery_dir, embedder.as_ref(), only).context("加载人脸库")?,
    );

    let ctx = PipelineContext::new(config.clone(), engine, gallery.clone(), embedder)?;

    if let (Some(name), Some(image_file)) = (&args.name, &args.image_file) {
        let path = ctx
            .seed_target_file(name, image_file)
            .with_context(|| format!("登记目标 {}", name))?;
        info!("✅ 目标 {} 已登记: {}", name, path.display());
    }

    let source = open_source(&args.source).with_context(|| format!("打开视频源 {}", args.source))?;
    let pipeline = Pipeline::start(ctx.clone(), source)?;

    // 搜索目标: 指定姓名, 否则人脸库全部身份
    let targets = match &args.name {
        Some(name) => vec![name.clone()],
        None => gallery.names(),
    };
    if targets.is_empty() {
        warn!("⚠️ 没有搜索目标, 告警不会触发");
    }
    pipeline.set_search_targets(targets);

    if let Some(search) = &args.search {
        let classes = parse_class_list(search)?;
        pipeline.reconfigure(&classes).context("切换检测类别")?;
    }

    {
        let ctx = ctx.clone();
        ctrlc::set_handler(move || ctx.request_shutdown()).context("注册 Ctrl-C 处理")?;
    }

    let mut sink: Box<dyn FrameSink> = match &config.snapshot_dir {
        Some(dir) => Box::new(SnapshotSink::new(dir)?),
        None => Box::new(NullSink::new()),
    };
    let result = pipeline.run_event_loop(sink.as_mut());
    pipeline.shutdown();

    let presented = result?;
    info!("👋 数字卫兵退出 (输出 {} 帧)", presented);
    Ok(())
}

fn build_backend(backend: &str, config: &PipelineConfig) -> sentinel_rs::Result<Backend> {
    match backend {
        "passthrough" => Ok(passthrough()),
        "ort" => ort_backend(config),
        other => Err(SentinelError::config(format!(
            "未知推理后端: {} (可选 ort / passthrough)",
            other
        ))),
    }
}

fn passthrough() -> Backend {
    (
        Box::new(ClassListCompiler::new(INF_SIZE)),
        Box::new(PassThroughAccelerator::new()),
    )
}

#[cfg(feature = "ort-backend")]
fn ort_backend(config: &PipelineConfig) -> sentinel_rs::Result<Backend> {
    use sentinel_rs::engine::ort_backend::OrtAccelerator;
    use sentinel_rs::engine::{ExportCommand, PrebuiltArtifacts};

    let compiler: Box<dyn ModelCompiler> = match &config.export_command {
        Some(command) => Box::new(ExportCommand::parse(command, config)?),
        None => Box::new(PrebuiltArtifacts::from_config(config)),
    };
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    Ok((compiler, Box::new(OrtAccelerator::new(threads))))
}

#[cfg(not(feature = "ort-backend"))]
fn ort_backend(_config: &PipelineConfig) -> sentinel_rs::Result<Backend> {
    warn!("⚠️ 未启用 ort-backend 特性, 使用直通加速器 (无检测)");
    Ok(passthrough())
}

#[cfg(feature = "ort-backend")]
fn build_embedder(config: &PipelineConfig) -> sentinel_rs::Result<Arc<dyn Embedder>> {
    use sentinel_rs::recognition::embedder::OrtEmbedder;

    match &config.embedder_model {
        Some(path) => Ok(Arc::new(OrtEmbedder::load(path, config.embedder_dim)?)),
        None => Ok(Arc::new(AppearanceEmbedder::new())),
    }
}

#[cfg(not(feature = "ort-backend"))]
fn build_embedder(config: &PipelineConfig) -> sentinel_rs::Result<Arc<dyn Embedder>> {
    if config.embedder_model.is_some() {
        warn!("⚠️ 未启用 ort-backend 特性, 忽略 embedder_model, 使用内置外观特征");
    }
    Ok(Arc::new(AppearanceEmbedder::new()))
}
