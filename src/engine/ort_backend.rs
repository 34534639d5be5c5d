// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! ONNX Runtime 加速器

use ndarray::{Array, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use super::accelerator::{Accelerator, ModelArtifact};
use crate::error::{Result, SentinelError};
use crate::models::RawOutput;

pub(crate) fn ort_error(e: ort::Error) -> SentinelError {
    SentinelError::accelerator(e.to_string())
}

/// 从文件创建推理会话
pub(crate) fn build_session(path: &std::path::Path, threads: usize) -> Result<Session> {
    Session::builder()
        .map_err(ort_error)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(ort_error)?
        .with_intra_threads(threads)
        .map_err(ort_error)?
        .commit_from_file(path)
        .map_err(ort_error)
}

pub struct OrtAccelerator {
    session: Option<Session>,
    threads: usize,
}

impl OrtAccelerator {
    pub fn new(threads: usize) -> Self {
        Self {
            session: None,
            threads: threads.max(1),
        }
    }
}

impl Accelerator for OrtAccelerator {
    fn connect(&mut self, artifact: &ModelArtifact) -> Result<()> {
        let path = artifact
            .path
            .as_ref()
            .ok_or_else(|| SentinelError::accelerator("ONNX 加速器需要模型文件"))?;
        let session = build_session(path, self.threads)?;
        info!(
            "✅ ONNX 模型已加载: {} ({} 个类别)",
            path.display(),
            artifact.classes.len()
        );
        self.session = Some(session);
        Ok(())
    }

    fn run(&mut self, input: Array<f32, IxDyn>) -> Result<RawOutput> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SentinelError::accelerator("加速器未连接"))?;
        // 输出0: 预测, 输出1 (分割模型): 掩码原型
        let names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let Some(preds_name) = names.first() else {
            return Err(SentinelError::accelerator("模型没有输出"));
        };

        let tensor = Tensor::from_array(input).map_err(ort_error)?;
        let outputs = session.run(ort::inputs![tensor]).map_err(ort_error)?;

        let preds = outputs[preds_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(ort_error)?
            .to_owned();
        let protos = match names.get(1) {
            Some(name) => Some(
                outputs[name.as_str()]
                    .try_extract_array::<f32>()
                    .map_err(ort_error)?
                    .to_owned(),
            ),
            None => None,
        };

        Ok(RawOutput {
            preds,
            protos,
            num_keypoints: 0,
        })
    }

    fn disconnect(&mut self) {
        self.session = None;
    }

    fn name(&self) -> &str {
        "onnxruntime"
    }
}
