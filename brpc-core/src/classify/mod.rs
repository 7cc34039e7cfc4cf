//! Нормализация сырых имён (классы окон, названия дистрибутивов) в ключи картинок.
//!
//! # Компоненты
//!
//! - **assets**: Таблицы алиасов и [`assets::AssetResolver`]
//!
//! # Пример
//!
//! ```rust
//! use brpc_core::classify::assets::{AssetResolver, AssetRules};
//!
//! let resolver = AssetResolver::new(AssetRules::builtin().expect("builtin rules"));
//! assert_eq!(resolver.resolve_window("Firefox").image_key, "firefox");
//! assert_eq!(resolver.resolve_distro("Arch Linux").image_key, "archlinux");
//! ```

pub mod assets;
