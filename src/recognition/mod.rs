// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 身份识别系统 (Recognition System)
///
/// - track:      共享轨迹表与轨迹状态机
/// - embedder:   身份特征提取
/// - gallery:    磁盘人脸库 (写时复制快照)
/// - recognizer: 识别工作线程与手动登记
pub mod embedder;
pub mod gallery;
pub mod recognizer;
pub mod track;

pub use embedder::{AppearanceEmbedder, Embedder};
pub use gallery::{Gallery, GalleryEntry, GalleryMatch, GallerySnapshot};
pub use recognizer::{square_crop, RecognitionHandle, RecognitionJob, Recognizer};
pub use track::{Embedding, TrackKey, TrackRegistry, TrackState, TrackedObject, UNKNOWN_NAME};
