// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 加速器与模型构建接口
//!
//! - `ModelCompiler`: 按类别集合重建模型产物
//! - `Accelerator`:   连接产物并执行前向推理

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use ndarray::{Array, IxDyn};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{Result, SentinelError};
use crate::models::RawOutput;

/// 按类别条件化的模型产物
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    /// 模型文件; 直通加速器不需要
    pub path: Option<PathBuf>,
    pub classes: Arc<[String]>,
    pub input_size: u32,
}

/// 模型构建器: 类别集合 → 产物
pub trait ModelCompiler: Send {
    fn compile(&mut self, classes: &[String]) -> Result<ModelArtifact>;
}

/// 加速器: 不透明的可重连执行后端
pub trait Accelerator: Send {
    fn connect(&mut self, artifact: &ModelArtifact) -> Result<()>;

    /// 前向推理: NCHW 张量 → 原始输出
    fn run(&mut self, input: Array<f32, IxDyn>) -> Result<RawOutput>;

    fn disconnect(&mut self);

    fn name(&self) -> &str;
}

/// 产物文件名: `<model>-<类别1>_<类别2>.onnx`
pub fn artifact_file_name(model_name: &str, classes: &[String]) -> String {
    let slug: Vec<String> = classes
        .iter()
        .map(|c| {
            c.trim()
                .to_lowercase()
                .chars()
                .map(|ch| if ch.is_alphanumeric() { ch } else { '-' })
                .collect()
        })
        .collect();
    format!("{}-{}.onnx", model_name, slug.join("_"))
}

// ========== 预先导出的模型 ==========

/// 在模型目录中查找已导出的产物
pub struct PrebuiltArtifacts {
    model_dir: PathBuf,
    model_name: String,
    input_size: u32,
}

impl PrebuiltArtifacts {
    pub fn new(model_dir: impl Into<PathBuf>, model_name: impl Into<String>, input_size: u32) -> Self {
        Self {
            model_dir: model_dir.into(),
            model_name: model_name.into(),
            input_size,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.model_dir, &config.model_name, crate::config::INF_SIZE)
    }
}

impl ModelCompiler for PrebuiltArtifacts {
    fn compile(&mut self, classes: &[String]) -> Result<ModelArtifact> {
        let path = self
            .model_dir
            .join(artifact_file_name(&self.model_name, classes));
        if !path.is_file() {
            return Err(SentinelError::config(format!(
                "未找到类别 {:?} 的模型文件 {}",
                classes,
                path.display()
            )));
        }
        debug!("使用预导出模型 {}", path.display());
        Ok(ModelArtifact {
            path: Some(path),
            classes: classes.to_vec().into(),
            input_size: self.input_size,
        })
    }
}

// ========== 外部导出命令 ==========

/// 调用外部导出程序生成产物
///
/// 命令行: `<program> <args...> <类别,逗号分隔> <输出路径>`
pub struct ExportCommand {
    program: String,
    args: Vec<String>,
    model_dir: PathBuf,
    model_name: String,
    input_size: u32,
}

impl ExportCommand {
    pub fn parse(command: &str, config: &PipelineConfig) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| SentinelError::config("导出命令为空"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            model_dir: config.model_dir.clone(),
            model_name: config.model_name.clone(),
            input_size: crate::config::INF_SIZE,
        })
    }

    fn output_path(&self, classes: &[String]) -> PathBuf {
        self.model_dir
            .join(artifact_file_name(&self.model_name, classes))
    }
}

impl ModelCompiler for ExportCommand {
    fn compile(&mut self, classes: &[String]) -> Result<ModelArtifact> {
        let output = self.output_path(classes);
        std::fs::create_dir_all(&self.model_dir)?;
        info!("导出模型: {} {:?} → {}", self.program, classes, output.display());

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(classes.join(","))
            .arg(&output)
            .status()?;
        if !status.success() {
            return Err(SentinelError::config(format!(
                "导出命令失败 ({}): {}",
                status, self.program
            )));
        }
        ensure_file(&output)?;

        Ok(ModelArtifact {
            path: Some(output),
            classes: classes.to_vec().into(),
            input_size: self.input_size,
        })
    }
}

fn ensure_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(SentinelError::config(format!(
            "导出命令未生成 {}",
            path.display()
        )))
    }
}

/// 不依赖模型文件的构建器 (配合直通加速器)
#[derive(Default)]
pub struct ClassListCompiler {
    input_size: u32,
}

impl ClassListCompiler {
    pub fn new(input_size: u32) -> Self {
        Self { input_size }
    }
}

impl ModelCompiler for ClassListCompiler {
    fn compile(&mut self, classes: &[String]) -> Result<ModelArtifact> {
        Ok(ModelArtifact {
            path: None,
            classes: classes.to_vec().into(),
            input_size: self.input_size,
        })
    }
}

// ========== 直通加速器 ==========

/// 直通加速器: 不执行网络, 每帧返回空输出
///
/// 未启用 `ort-backend` 时使用, 流水线其余部分照常运行
#[derive(Default)]
pub struct PassThroughAccelerator {
    num_classes: Option<usize>,
}

impl PassThroughAccelerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Accelerator for PassThroughAccelerator {
    fn connect(&mut self, artifact: &ModelArtifact) -> Result<()> {
        self.num_classes = Some(artifact.classes.len());
        Ok(())
    }

    fn run(&mut self, _input: Array<f32, IxDyn>) -> Result<RawOutput> {
        match self.num_classes {
            Some(nc) => Ok(RawOutput::empty(nc)),
            None => Err(SentinelError::accelerator("加速器未连接")),
        }
    }

    fn disconnect(&mut self) {
        self.num_classes = None;
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_artifact_file_name() {
        assert_eq!(
            artifact_file_name("yoloe-v8s-seg", &classes(&["person", "red car"])),
            "yoloe-v8s-seg-person_red-car.onnx"
        );
    }

    #[test]
    fn test_prebuilt_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = PrebuiltArtifacts::new(dir.path(), "m", 640);
        assert!(compiler.compile(&classes(&["dog"])).is_err());

        std::fs::write(dir.path().join("m-dog.onnx"), b"onnx").unwrap();
        let artifact = compiler.compile(&classes(&["dog"])).unwrap();
        assert_eq!(&*artifact.classes, &["dog".to_string()]);
        assert_eq!(artifact.input_size, 640);
    }

    #[test]
    fn test_export_command_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            model_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut compiler = ExportCommand::parse("sentinel-no-such-exporter --fast", &config).unwrap();
        assert!(compiler.compile(&classes(&["dog"])).is_err());
        assert!(ExportCommand::parse("   ", &config).is_err());
    }

    #[test]
    fn test_passthrough_requires_connect() {
        let mut acc = PassThroughAccelerator::new();
        let input = Array::zeros(IxDyn(&[1, 3, 4, 4]));
        assert!(acc.run(input.clone()).is_err());

        let artifact = ClassListCompiler::new(640)
            .compile(&classes(&["person", "dog"]))
            .unwrap();
        acc.connect(&artifact).unwrap();
        let raw = acc.run(input).unwrap();
        assert_eq!(raw.preds.shape(), &[1, 6, 0]);
    }
}
