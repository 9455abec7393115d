// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Android manifest model, deserialized from the decoded binary XML. Only
//! the parts the resolver cares about are represented; everything else maps
//! to `Unknown`.

fn default_as_false() -> bool {
    false
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidManifest {
    #[serde(rename = "versionCode", default)]
    pub version_code: String,
    #[serde(rename = "versionName", default)]
    pub version_name: String,
    pub package: String,
    #[serde(rename = "$value", default)]
    pub content: Vec<ManifestEntry>,
}

impl AndroidManifest {
    pub fn application(&self) -> Option<&AndroidApplication> {
        self.content.iter().find_map(|entry| match entry {
            ManifestEntry::Application(app) => Some(app),
            _ => None,
        })
    }

    pub fn permissions(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|entry| match entry {
                ManifestEntry::UsesPermission(p) => Some(p.name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The fully qualified name of the main activity, when one is declared.
    pub fn main_activity(&self) -> Option<String> {
        let application = self.application()?;
        application
            .components
            .iter()
            .find_map(|component| match component {
                AppComponent::Activity(activity) | AppComponent::ActivityAlias(activity) => {
                    let is_main = activity.intent_filters.iter().any(|filter| {
                        filter.content.iter().any(|content| matches!(
                            content,
                            IntentContent::Action(action)
                                if action.name == "android.intent.action.MAIN"
                        ))
                    });
                    if is_main {
                        Some(self.qualify(&activity.name))
                    } else {
                        None
                    }
                }
                _ => None,
            })
    }

    fn qualify(&self, name: &str) -> String {
        if name.starts_with('.') {
            format!("{}{}", self.package, name)
        } else {
            name.to_string()
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ManifestEntry {
    #[serde(rename = "uses-permission")]
    #[serde(alias = "permission")]
    #[serde(alias = "uses-permission-sdk-23")]
    UsesPermission(AndroidPermission),
    #[serde(rename = "uses-sdk")]
    UsesSdk(AndroidSdk),
    #[serde(rename = "application")]
    Application(AndroidApplication),
    #[serde(rename = "uses-feature")]
    #[serde(alias = "queries")]
    #[serde(alias = "supports-screens")]
    Unknown(Unknown),
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidSdk {
    #[serde(rename = "minSdkVersion", default)]
    pub min_sdk_version: String,
    #[serde(rename = "targetSdkVersion", default)]
    pub target_sdk_version: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidPermission {
    pub name: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidApplication {
    #[serde(rename = "allowBackup", default = "default_as_false")]
    pub allow_backup: bool,
    #[serde(default = "default_as_false")]
    pub debuggable: bool,
    #[serde(rename = "$value", default)]
    pub components: Vec<AppComponent>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum AppComponent {
    #[serde(rename = "activity")]
    Activity(AndroidActivity),
    #[serde(rename = "activity-alias")]
    ActivityAlias(AndroidActivity),
    #[serde(rename = "receiver")]
    #[serde(alias = "service")]
    #[serde(alias = "provider")]
    #[serde(alias = "meta-data")]
    #[serde(alias = "uses-library")]
    Unknown(Unknown),
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidActivity {
    pub name: String,
    #[serde(rename = "intent-filter", default)]
    pub intent_filters: Vec<AndroidIntentFilter>,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidIntentFilter {
    #[serde(rename = "$value", default)]
    pub content: Vec<IntentContent>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum IntentContent {
    #[serde(rename = "action")]
    Action(AndroidIntentAction),
    #[serde(rename = "category")]
    Category(AndroidIntentCategory),
    #[serde(rename = "data")]
    Data(Unknown),
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidIntentAction {
    pub name: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct AndroidIntentCategory {
    pub name: String,
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Unknown {}
