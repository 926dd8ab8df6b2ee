//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 统一工具模块
//!
//! 提供库内部和测试共用的工具函数，包括：
//! - 日志设置工具
//! - 缓存名称生成工具
//! - panic 信息与现场调用栈提取工具

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();
static PANIC_HOOK: Once = Once::new();

thread_local! {
    /// 本线程最近一次 panic 发生时捕获的调用栈
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// 初始化日志输出
///
/// 多次调用只会生效一次，`RUST_LOG` 未设置时使用 debug 级别
pub fn setup_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(filter)
            .try_init()
            .ok();
    });
}

/// 生成唯一的缓存名称
pub fn generate_unique_cache_name(base: &str) -> String {
    format!("{}_{}", base, uuid::Uuid::new_v4().simple())
}

/// 从 panic 负载中提取可读信息
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// 安装记录 panic 现场调用栈的钩子
///
/// 钩子在 panic 发生的线程上运行，此时调用栈仍指向出错位置；
/// 原有钩子继续被调用。多次调用只安装一次。
pub fn install_panic_backtrace_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// 取出本线程最近一次 panic 的现场调用栈
///
/// 需要在 `catch_unwind` 返回后、同一线程上立即调用
pub fn take_panic_backtrace() -> String {
    PANIC_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| "<backtrace unavailable>".to_string())
}
