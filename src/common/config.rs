//! Allows configuration stuff to be read from settings.json
//!
//! The engine runs fine with no file at all; everything has a default.
//! Main use is overriding the reaper timeouts and room sizing when
//! running locally instead of on a deployed box.
use json::JsonValue;
use std::{
    fs::File,
    io::{ErrorKind, Write},
};

pub struct Config {
    filename: String,
    settings: JsonValue,
}

impl Config {
    pub fn build() -> Config {
        Config {
            filename: String::from("settings.json"),
            settings: json::object! {},
        }
    }
    pub fn get_filename(&self) -> &str {
        &self.filename
    }
    pub fn load_from_file(&mut self) -> std::io::Result<bool> {
        match std::fs::read_to_string(&self.filename) {
            Ok(raw_data) => {
                match json::parse(&raw_data) {
                    Ok(parsed) => {
                        self.settings.clone_from(&parsed);
                        Ok(true)
                    }
                    Err(_) => {
                        // garbage in the file, run on defaults
                        Ok(false)
                    }
                }
            }
            Err(_) => {
                // call save settings to create a new file
                self.save_settings()
            }
        }
    }

    pub fn get_value<'a>(&'a self, key: &str, def_value: &'a str) -> &'a str {
        match self.settings[key].as_str() {
            None => def_value,
            Some(i) => i,
        }
    }

    pub fn get_u32_value(&self, key: &str, def_value: u32) -> u32 {
        match self.settings[key].as_u32() {
            None => def_value,
            Some(i) => i,
        }
    }

    pub fn get_bool_value(&self, key: &str, def_value: bool) -> bool {
        // expects JSON value as type bool (unquoted), any string or numeric will evaluate to true
        match self.settings[key].as_bool() {
            None => def_value,
            Some(i) => i,
        }
    }

    pub fn set_value(&mut self, key: &str, val: &str) -> () {
        self.settings[key] = val.into();
    }

    pub fn save_settings(&self) -> std::io::Result<bool> {
        let file_open_result = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.filename.as_str());
        match file_open_result {
            Ok(mut f) => self.flush_to_file(&mut f),
            Err(error) => {
                // File open failed.  See if we need to create it
                match error.kind() {
                    ErrorKind::NotFound => {
                        // no file, create one
                        let mut f = std::fs::File::create(self.filename.as_str())?;
                        self.flush_to_file(&mut f)
                    }
                    _ => Err(error),
                }
            }
        }
    }
    fn flush_to_file(&self, f: &mut File) -> std::io::Result<bool> {
        f.write_all(self.settings.pretty(2).as_bytes())?;
        f.sync_all()?;
        Ok(true)
    }
}
