// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 集成测试共用的脚本化加速器与构建器
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use ndarray::{Array, IxDyn};
use parking_lot::Mutex;

use sentinel_rs::engine::{Accelerator, ModelArtifact, ModelCompiler};
use sentinel_rs::models::RawOutput;
use sentinel_rs::Result;

pub const INPUT_SIZE: u32 = 64;

pub fn classes(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// 模型输入坐标系中的候选框 (cx, cy, w, h, 类别, 置信度)
#[derive(Clone, Copy, Debug)]
pub struct ScriptedBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub class_id: usize,
    pub score: f32,
}

/// 按脚本输出固定候选框的加速器
///
/// - `delay`:   每次推理的耗时
/// - `gate`:    每次推理前等待一个放行信号
/// - `running`: 开始推理时发出通知
/// - `fail_connect_on`: 连接这组类别时失败
#[derive(Default)]
pub struct ScriptedAccelerator {
    pub boxes: Vec<ScriptedBox>,
    pub delay: Duration,
    pub gate: Option<Receiver<()>>,
    pub running: Option<Sender<()>>,
    pub connected: Arc<Mutex<Vec<Vec<String>>>>,
    pub num_classes: Option<usize>,
    pub fail_connect_on: Option<Vec<String>>,
}

impl ScriptedAccelerator {
    pub fn new(boxes: Vec<ScriptedBox>) -> Self {
        Self {
            boxes,
            ..Default::default()
        }
    }
}

impl Accelerator for ScriptedAccelerator {
    fn connect(&mut self, artifact: &ModelArtifact) -> Result<()> {
        if self.fail_connect_on.as_deref() == Some(&artifact.classes[..]) {
            return Err(sentinel_rs::SentinelError::accelerator("设备断开"));
        }
        self.num_classes = Some(artifact.classes.len());
        self.connected.lock().push(artifact.classes.to_vec());
        Ok(())
    }

    fn run(&mut self, _input: Array<f32, IxDyn>) -> Result<RawOutput> {
        let nc = self
            .num_classes
            .ok_or_else(|| sentinel_rs::SentinelError::accelerator("未连接"))?;
        if let Some(running) = &self.running {
            let _ = running.send(());
        }
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut preds = Array::zeros(IxDyn(&[1, 4 + nc, self.boxes.len()]));
        for (i, b) in self.boxes.iter().enumerate() {
            preds[[0, 0, i]] = b.cx;
            preds[[0, 1, i]] = b.cy;
            preds[[0, 2, i]] = b.w;
            preds[[0, 3, i]] = b.h;
            if b.class_id < nc {
                preds[[0, 4 + b.class_id, i]] = b.score;
            }
        }
        Ok(RawOutput {
            preds,
            protos: None,
            num_keypoints: 0,
        })
    }

    fn disconnect(&mut self) {
        self.num_classes = None;
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// 可在第 N 次构建时阻塞的构建器
#[derive(Default)]
pub struct ScriptedCompiler {
    pub calls: usize,
    /// 第二次及以后的构建: 先通知进入, 再等待放行
    pub entered: Option<Sender<()>>,
    pub release: Option<Receiver<()>>,
    pub fail_on: Option<Vec<String>>,
}

impl ModelCompiler for ScriptedCompiler {
    fn compile(&mut self, classes: &[String]) -> Result<ModelArtifact> {
        self.calls += 1;
        if self.calls > 1 {
            if let Some(entered) = &self.entered {
                let _ = entered.send(());
            }
            if let Some(release) = &self.release {
                let _ = release.recv();
            }
        }
        if self.fail_on.as_deref() == Some(classes) {
            return Err(sentinel_rs::SentinelError::config("脚本化构建失败"));
        }
        Ok(ModelArtifact {
            path: None,
            classes: classes.to_vec().into(),
            input_size: INPUT_SIZE,
        })
    }
}
