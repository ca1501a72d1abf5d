mod modes;
mod streaming;
