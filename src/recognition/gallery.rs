// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 人脸库 (Gallery)
//!
//! 磁盘布局: `<root>/<姓名>/<i>.jpg`, 可选特征旁注 `<i>.json`
//!
//! 启动时一次性加载; 登记时写时复制, 读者通过 Arc 快照匹配, 不会被写者阻塞

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::embedder::Embedder;
use super::track::Embedding;
use crate::error::{Result, SentinelError};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 单个身份的参考特征
#[derive(Clone, Debug)]
pub struct GalleryEntry {
    pub name: String,
    pub embeddings: Vec<Embedding>,
    pub images: Vec<PathBuf>,
}

/// 最近邻匹配结果
#[derive(Clone, Debug, PartialEq)]
pub struct GalleryMatch {
    pub name: String,
    pub distance: f32,
}

/// 特征旁注文件
#[derive(Serialize, Deserialize)]
struct EmbeddingRecord {
    embedder: String,
    values: Vec<f32>,
}

/// 不可变快照
#[derive(Clone, Debug, Default)]
pub struct GallerySnapshot {
    entries: Vec<GalleryEntry>,
}

impl GallerySnapshot {
    /// 余弦距离最近的身份
    pub fn best_match(&self, embedding: &Embedding) -> Option<GalleryMatch> {
        self.entries
            .iter()
            .flat_map(|entry| {
                entry.embeddings.iter().map(move |e| GalleryMatch {
                    name: entry.name.clone(),
                    distance: embedding.cosine_distance(e),
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn entry(&self, name: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn embedding_count(&self) -> usize {
        self.entries.iter().map(|e| e.embeddings.len()).sum()
    }
}

pub struct Gallery {
    root: PathBuf,
    embedder_name: String,
    snapshot: RwLock<Arc<GallerySnapshot>>,
    // 串行化写者 (分配序号 + 发布快照)
    writer: Mutex<()>,
}

impl Gallery {
    /// 加载人脸库; `only` 指定时只加载该身份
    pub fn load(root: impl AsRef<Path>, embedder: &dyn Embedder, only: Option<&str>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut dirs: Vec<PathBuf> = fs::read_dir(&root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut entries = Vec::new();
        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if only.is_some_and(|o| o != name) {
                continue;
            }
            let entry = load_entry(&dir, &name, embedder)?;
            if entry.embeddings.is_empty() {
                debug!("身份 {} 没有可用图片, 跳过", name);
                continue;
            }
            entries.push(entry);
        }

        let snapshot = GallerySnapshot { entries };
        info!(
            "✅ 人脸库已加载: {} 个身份, {} 个特征 ({})",
            snapshot.len(),
            snapshot.embedding_count(),
            root.display()
        );
        Ok(Self {
            root,
            embedder_name: embedder.name().to_string(),
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 当前快照 (只在交换指针时短暂加读锁)
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        self.snapshot.read().clone()
    }

    pub fn best_match(&self, embedding: &Embedding) -> Option<GalleryMatch> {
        self.snapshot().best_match(embedding)
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    /// 追加参考图片与特征, 返回图片路径
    pub fn add(&self, name: &str, crop: &RgbImage, embedding: &Embedding) -> Result<PathBuf> {
        validate_name(name)?;
        let _writer = self.writer.lock();

        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;
        let mut index = 0;
        while dir.join(format!("{}.jpg", index)).exists() {
            index += 1;
        }
        let image_path = dir.join(format!("{}.jpg", index));
        crop.save(&image_path)?;

        let record = EmbeddingRecord {
            embedder: self.embedder_name.clone(),
            values: embedding.as_slice().to_vec(),
        };
        fs::write(
            dir.join(format!("{}.json", index)),
            serde_json::to_string(&record)?,
        )?;

        // 写时复制后发布
        let mut next = (*self.snapshot()).clone();
        match next.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.embeddings.push(embedding.clone());
                entry.images.push(image_path.clone());
            }
            None => next.entries.push(GalleryEntry {
                name: name.to_string(),
                embeddings: vec![embedding.clone()],
                images: vec![image_path.clone()],
            }),
        }
        *self.snapshot.write() = Arc::new(next);

        info!("💾 已登记 {} → {}", name, image_path.display());
        Ok(image_path)
    }
}

/// 身份名即目录名
pub fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
    {
        return Err(SentinelError::Gallery(format!("非法身份名: {:?}", name)));
    }
    Ok(())
}

fn load_entry(dir: &Path, name: &str, embedder: &dyn Embedder) -> Result<GalleryEntry> {
    let mut images: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        })
        .map(|p| {
            let order = p
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            (order, p)
        })
        .collect();
    images.sort();

    let mut entry = GalleryEntry {
        name: name.to_string(),
        embeddings: Vec::new(),
        images: Vec::new(),
    };
    for (_, path) in images {
        match load_embedding(&path, embedder) {
            Ok(e) => {
                entry.embeddings.push(e);
                entry.images.push(path);
            }
            Err(e) => warn!("⚠️ 跳过参考图片 {}: {}", path.display(), e),
        }
    }
    Ok(entry)
}

/// 旁注可用 (同一特征提取器, 维度一致) 时直接读取, 否则重新计算
fn load_embedding(image_path: &Path, embedder: &dyn Embedder) -> Result<Embedding> {
    let sidecar = image_path.with_extension("json");
    if let Ok(text) = fs::read_to_string(&sidecar) {
        match serde_json::from_str::<EmbeddingRecord>(&text) {
            Ok(record) if record.embedder == embedder.name() && record.values.len() == embedder.dim() => {
                return Embedding::new(record.values);
            }
            Ok(_) => debug!("旁注 {} 与当前特征提取器不符, 重新计算", sidecar.display()),
            Err(e) => debug!("旁注 {} 解析失败: {}", sidecar.display(), e),
        }
    }
    let image = image::open(image_path)?.to_rgb8();
    embedder.embed(&image)
}
