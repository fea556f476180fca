use serde::Serialize;

/// Where an effective limit came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetSource {
    Param,
    Env,
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Budget {
    pub value: u64,
    pub source: BudgetSource,
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse::<u64>().ok()
}

/// Resolve a limit: param → env(`env_name`) → default, clamped to `[min, max]`.
pub fn resolve_budget(
    param: Option<u64>,
    env_name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Budget {
    let (value, source) = if let Some(p) = param {
        (p, BudgetSource::Param)
    } else if let Some(envv) = parse_env_u64(env_name) {
        (envv, BudgetSource::Env)
    } else {
        (default, BudgetSource::Default)
    };

    Budget {
        value: value.clamp(min, max),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_wins_and_is_clamped() {
        let budget = resolve_budget(Some(0), "MIRRORKIT_TEST_UNSET_BUDGET", 10, 1, 100);
        assert_eq!(budget.value, 1);
        assert_eq!(budget.source, BudgetSource::Param);
    }

    #[test]
    fn default_used_when_nothing_set() {
        let budget = resolve_budget(None, "MIRRORKIT_TEST_UNSET_BUDGET", 10, 1, 100);
        assert_eq!(budget.value, 10);
        assert_eq!(budget.source, BudgetSource::Default);
    }
}
