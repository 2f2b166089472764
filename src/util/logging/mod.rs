//! 日志规范（事件名等共享元数据）

pub mod standards;
