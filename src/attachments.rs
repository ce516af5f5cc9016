//! 附件水合：把状态中只存引用的附件转换为 LLM 可读的图片地址
//!
//! 存储与上传在外部完成，这里只定义接口与两个实现。

use async_trait::async_trait;

use crate::memory::AttachmentRef;

/// 可直接交给 LLM 的附件（https 地址或 data: URL）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydratedAttachment {
    pub reference: AttachmentRef,
    pub data_url: String,
}

/// 附件解析器
#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    /// 无法获取时返回 None，该附件在本轮被跳过
    async fn hydrate(&self, attachment: &AttachmentRef) -> Option<HydratedAttachment>;
}

/// 不做水合：所有附件只以文件名形式出现在上下文里
#[derive(Debug, Clone, Default)]
pub struct NoopAttachmentResolver;

#[async_trait]
impl AttachmentResolver for NoopAttachmentResolver {
    async fn hydrate(&self, _attachment: &AttachmentRef) -> Option<HydratedAttachment> {
        None
    }
}

/// 直接使用引用上的远程 URL（仅 http/https）
#[derive(Debug, Clone, Default)]
pub struct UrlAttachmentResolver;

#[async_trait]
impl AttachmentResolver for UrlAttachmentResolver {
    async fn hydrate(&self, attachment: &AttachmentRef) -> Option<HydratedAttachment> {
        let url = attachment.url.as_deref()?;
        if url.starts_with("https://") || url.starts_with("http://") {
            Some(HydratedAttachment {
                reference: attachment.clone(),
                data_url: url.to_string(),
            })
        } else {
            None
        }
    }
}

/// 附件的文字描述，水合失败时附在消息正文后
pub fn describe(attachments: &[AttachmentRef]) -> String {
    attachments
        .iter()
        .map(|a| format!("[attachment: {} ({}, {} bytes)]", a.filename, a.mime_type, a.size))
        .collect::<Vec<_>>()
        .join("\n")
}
