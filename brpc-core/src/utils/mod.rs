//! Вспомогательные функции, не относящиеся к сбору метрик.

pub mod process;
